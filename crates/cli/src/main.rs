//! `geoproc`: submit process chains, run queue workers and inspect
//! resources of a geoproc project.

mod commands;
mod logging;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "geoproc")]
#[command(about = "Run geoprocessing chains as asynchronous jobs", long_about = None)]
struct Cli {
    /// Project root holding the .geoproc directory
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate and queue a chain
    Submit {
        #[command(flatten)]
        target: Target,

        /// Persistent target mapset; ephemeral when omitted
        #[arg(long)]
        mapset: Option<String>,

        /// Export declared outputs to storage
        #[arg(long)]
        export: bool,

        /// Wait for the terminal record (always on with the local queue)
        #[arg(long)]
        wait: bool,
    },

    /// Validate a chain without running it
    Validate {
        #[command(flatten)]
        target: Target,

        #[arg(long)]
        mapset: Option<String>,
    },

    /// Print a resource record
    Status {
        resource_id: String,
    },

    /// Consume the distributed queue until interrupted
    Worker {
        /// Jobs run at once (defaults to queue.workers)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Apply the retention policy to finished records
    Evict,
}

#[derive(Args)]
struct Target {
    #[arg(long)]
    user: String,

    #[arg(long)]
    location: String,

    /// Chain description file (.yaml, .yml or .json)
    #[arg(long, conflicts_with = "chain", required_unless_present = "chain")]
    file: Option<PathBuf>,

    /// Named chain from .geoproc/chains
    #[arg(long)]
    chain: Option<String>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = gp_core::config::load_config(&cli.root).await?;

    match cli.command {
        Command::Submit {
            target,
            mapset,
            export,
            wait,
        } => {
            let source = commands::ChainSource::from_args(target.file, target.chain)?;
            let request = commands::RequestArgs {
                user: target.user,
                location: target.location,
                mapset,
                export,
                source,
            };
            commands::submit(config, request, wait).await
        }
        Command::Validate { target, mapset } => {
            let source = commands::ChainSource::from_args(target.file, target.chain)?;
            let request = commands::RequestArgs {
                user: target.user,
                location: target.location,
                mapset,
                export: false,
                source,
            };
            commands::validate(config, request).await
        }
        Command::Status { resource_id } => commands::status(config, &resource_id).await,
        Command::Worker { concurrency } => commands::worker(config, concurrency).await,
        Command::Evict => commands::evict(config).await,
    }
}
