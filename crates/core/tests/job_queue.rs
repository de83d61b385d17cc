//! Distributed queue tests: a submitting runtime and a worker runtime
//! sharing one file-backed store.

mod common;

use common::*;
use gp_core::queue::DistributedQueue;
use gp_core::runner::{ScriptedRunner, ScriptedStep};
use gp_core::runtime::Runtime;
use gp_protocol::{QueueKind, ResourceStatus, StoreConfig, UserProfile};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn distributed_runtime(env: &TestEnv, users: Vec<UserProfile>, runner: ScriptedRunner) -> Runtime {
    let mut config = env.app_config(users);
    config.engine.queue.kind = QueueKind::Distributed;
    config.engine.queue.store = StoreConfig::Filesystem {
        path: env.root().join("store"),
    };
    Runtime::build(config, Arc::new(runner)).expect("Failed to build runtime")
}

#[tokio::test]
async fn test_jobs_wait_in_the_store_until_a_worker_runs() {
    // Given: a submitting runtime without any worker
    let env = TestEnv::new().expect("Failed to create test env");
    let submitter = distributed_runtime(&env, vec![alice()], ScriptedRunner::new());
    assert_eq!(submitter.queue_kind(), QueueKind::Distributed);
    let service = submitter.service();

    let response = service
        .submit(request(
            "alice",
            None,
            chain(vec![r_info("elevation@PERMANENT")]),
        ))
        .await
        .expect("Submission failed");
    assert_eq!(response.status, ResourceStatus::Accepted);

    // Then: the record stays accepted
    let record = service
        .wait(&response.resource_id, Duration::from_millis(200))
        .await
        .expect("Wait failed");
    assert_eq!(record.status, ResourceStatus::Accepted);

    // When: a worker with its own runtime starts on the same store
    let worker_runtime = distributed_runtime(
        &env,
        vec![alice()],
        ScriptedRunner::new().on("r.info", ScriptedStep::success("rows=100\n")),
    );
    let worker = worker_runtime.worker(Some(1));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    // Then: the job is claimed and finished
    let record = service
        .wait(&response.resource_id, Duration::from_secs(10))
        .await
        .expect("Wait failed");
    assert_finished(&record, 1);

    shutdown.cancel();
    handle
        .await
        .expect("Worker panicked")
        .expect("Worker failed");
}

#[tokio::test]
async fn test_each_job_is_claimed_once() {
    let env = TestEnv::new().expect("Failed to create test env");
    let runtime = distributed_runtime(&env, vec![alice()], ScriptedRunner::new());
    let service = runtime.service();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let response = service
            .submit(request(
                "alice",
                None,
                chain(vec![r_info("elevation@PERMANENT")]),
            ))
            .await
            .expect("Submission failed");
        ids.push(response.resource_id);
    }

    let store = env.root().join("store");
    let queue = DistributedQueue::new(Arc::new(
        gp_core::store::FileStore::open(&store).expect("Failed to open store"),
    ));
    assert_eq!(queue.pending().await.expect("Pending failed"), 3);

    // Two workers race over the same entries
    let first = runtime.worker(Some(2));
    let second = runtime.worker(Some(2));
    let mut claimed = Vec::new();
    loop {
        let (a, b) = tokio::join!(first.claim_next(), second.claim_next());
        let a = a.expect("Claim failed");
        let b = b.expect("Claim failed");
        if a.is_none() && b.is_none() {
            break;
        }
        claimed.extend(a.into_iter().chain(b).map(|job| job.resource_id));
    }

    claimed.sort();
    ids.sort();
    assert_eq!(claimed, ids);
    assert_eq!(queue.pending().await.expect("Pending failed"), 0);
}

#[tokio::test]
async fn test_worker_stops_on_cancellation() {
    let env = TestEnv::new().expect("Failed to create test env");
    let runtime = distributed_runtime(&env, vec![alice()], ScriptedRunner::new());
    let worker = runtime.worker(None);

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), worker.run(shutdown))
        .await
        .expect("Worker did not stop")
        .expect("Worker failed");
}
