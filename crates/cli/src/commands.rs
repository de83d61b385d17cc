//! Subcommand handlers. Records and chains go to stdout as JSON, summaries
//! to stderr.

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use colored::Colorize;
use gp_core::config::AppConfig;
use gp_core::runtime::Runtime;
use gp_core::service::SubmitRequest;
use gp_protocol::{
    ApiInfo, ChainDescription, QueueKind, RequestPayload, ResourceRecord, ResourceStatus,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub enum ChainSource {
    File(PathBuf),
    Named(String),
}

impl ChainSource {
    pub fn from_args(file: Option<PathBuf>, chain: Option<String>) -> Result<Self> {
        match (file, chain) {
            (Some(path), _) => Ok(ChainSource::File(path)),
            (None, Some(name)) => Ok(ChainSource::Named(name)),
            (None, None) => bail!("Either --file or --chain is required"),
        }
    }

    fn load(&self, config: &AppConfig) -> Result<ChainDescription> {
        match self {
            ChainSource::File(path) => read_chain(path),
            ChainSource::Named(name) => config.chains.get(name).cloned().ok_or_else(|| {
                let known: Vec<&str> = config.chains.keys().map(String::as_str).collect();
                eyre!("Unknown chain '{name}' (known: {})", known.join(", "))
            }),
        }
    }
}

fn read_chain(path: &Path) -> Result<ChainDescription> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    let chain = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .wrap_err_with(|| format!("Invalid chain in {}", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .wrap_err_with(|| format!("Invalid chain in {}", path.display()))?
    };
    Ok(chain)
}

pub struct RequestArgs {
    pub user: String,
    pub location: String,
    pub mapset: Option<String>,
    pub export: bool,
    pub source: ChainSource,
}

impl RequestArgs {
    fn into_request(self, config: &AppConfig, command: &str) -> Result<SubmitRequest> {
        let chain = self.source.load(config)?;
        let path = format!("geoproc {command}");
        Ok(SubmitRequest {
            user_id: self.user,
            location: self.location,
            mapset: self.mapset,
            export: self.export,
            payload: RequestPayload::ProcessChain(chain),
            api_info: ApiInfo {
                endpoint: command.to_string(),
                method: "CLI".to_string(),
                request_url: path.clone(),
                path,
            },
        })
    }
}

fn open_runtime(config: AppConfig) -> Result<Runtime> {
    Runtime::from_config(config).map_err(|e| eyre!(e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status_label(status: ResourceStatus) -> &'static str {
    match status {
        ResourceStatus::Accepted => "accepted",
        ResourceStatus::Running => "running",
        ResourceStatus::Finished => "finished",
        ResourceStatus::Error => "error",
        ResourceStatus::Terminated => "terminated",
    }
}

fn summarize(record: &ResourceRecord) {
    let label = status_label(record.status);
    let status = match record.status {
        ResourceStatus::Finished => label.green(),
        ResourceStatus::Error | ResourceStatus::Terminated => label.red(),
        ResourceStatus::Accepted | ResourceStatus::Running => label.yellow(),
    };
    eprintln!(
        "{} {} ({}/{} steps)",
        record.resource_id.bold(),
        status,
        record.progress.step,
        record.progress.num_of_steps
    );
    if let Some(exception) = &record.exception {
        eprintln!("  {}", exception.message);
    }
}

fn finish(record: &ResourceRecord) -> Result<()> {
    summarize(record);
    print_json(record)?;
    match record.status {
        ResourceStatus::Error | ResourceStatus::Terminated => {
            bail!(
                "Resource {} ended with status {}",
                record.resource_id,
                status_label(record.status)
            )
        }
        _ => Ok(()),
    }
}

pub async fn submit(config: AppConfig, args: RequestArgs, wait: bool) -> Result<()> {
    let request = args.into_request(&config, "submit")?;
    let runtime = open_runtime(config)?;
    let service = runtime.service();

    if runtime.queue_kind() == QueueKind::Local || wait {
        let record = service.submit_and_wait(request).await?;
        runtime.shutdown().await;
        return finish(&record);
    }

    let response = service.submit(request).await?;
    eprintln!(
        "{} {} {}",
        response.resource_id.bold(),
        "accepted".cyan(),
        response.urls.status
    );
    print_json(&response)
}

pub async fn validate(config: AppConfig, args: RequestArgs) -> Result<()> {
    let request = args.into_request(&config, "validate")?;
    let runtime = open_runtime(config)?;
    let chain = runtime.service().validate(&request)?;
    eprintln!("{} {} steps", "valid".green(), chain.len());
    print_json(&chain)
}

pub async fn status(config: AppConfig, resource_id: &str) -> Result<()> {
    let runtime = open_runtime(config)?;
    let record = runtime.service().status(resource_id).await?;
    summarize(&record);
    print_json(&record)
}

pub async fn worker(config: AppConfig, concurrency: Option<usize>) -> Result<()> {
    let runtime = open_runtime(config)?;
    if runtime.queue_kind() != QueueKind::Distributed {
        bail!("queue.kind is not 'distributed'; workers only consume the distributed queue");
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing running jobs");
        }
        signal.cancel();
    });

    runtime.worker(concurrency).run(shutdown).await?;
    Ok(())
}

pub async fn evict(config: AppConfig) -> Result<()> {
    let runtime = open_runtime(config)?;
    let service = runtime.service();
    let evicted = service.evict().await?;
    let stale = service
        .terminate_stale(Duration::from_secs(
            runtime.config().engine.service.job_timeout_secs,
        ))
        .await?;

    eprintln!(
        "{} evicted, {} stale records terminated",
        evicted.len().to_string().bold(),
        stale.len().to_string().bold()
    );
    print_json(&serde_json::json!({ "evicted": evicted, "terminated": stale }))
}
