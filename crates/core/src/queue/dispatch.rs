use crate::engine::{build_job, JobRun, ProcessingMachine, WorkerServices, INTERNAL_ERROR_MESSAGE};
use crate::registry::Outcome;
use gp_protocol::{ErrorCode, ExceptionInfo, JobDescriptor};
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Claim `job` in the registry and run it to completion.
///
/// The machine runs in its own task so a panicking job is contained and
/// finalized as an internal error instead of taking the worker down.
pub async fn run_job(services: WorkerServices, job: JobDescriptor) {
    let registry = services.registry.clone();
    let resource_id = job.resource_id.clone();

    // Running from the claim on; a persistent job takes its workspace lock
    // afterwards and may still end in lock_busy.
    match registry.mark_running(&resource_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(resource_id = %resource_id, "Job is not in accepted state, skipping");
            return;
        }
        Err(e) => {
            tracing::error!(resource_id = %resource_id, error = %e, "Failed to claim job");
            return;
        }
    }

    let span = tracing::info_span!(
        "processing_job",
        resource_id = %resource_id,
        user_id = %job.context.user_id(),
        handler = %job.handler
    );

    let job_timeout = Duration::from_secs(job.timeout_secs);
    let run = JobRun {
        resource_id: resource_id.clone(),
        chain: job.chain,
        context: job.context,
        job_timeout,
        deadline: Instant::now() + job_timeout,
        services,
    };
    let machine = ProcessingMachine::new(build_job(job.handler), run);

    let handle = tokio::spawn(machine.execute().instrument(span));
    if let Err(join_error) = handle.await {
        tracing::error!(resource_id = %resource_id, error = %join_error, "Processing task aborted");
        let outcome = Outcome::failed(ExceptionInfo {
            code: ErrorCode::InternalError,
            message: INTERNAL_ERROR_MESSAGE.to_string(),
            failed_step: None,
            retryable: false,
        });
        if let Err(e) = registry.finalize(&resource_id, outcome).await {
            tracing::error!(resource_id = %resource_id, error = %e, "Failed to finalize aborted job");
        }
    }
}
