//! Master binary

use clap::{Parser, Subcommand};
use failover::common::{Config, LogSyncPolicy};
use failover::master::{Collaborators, InMemoryCluster};
use failover::Master;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "failover-master")]
#[command(about = "Failover master: crash-safe server recovery orchestration")]
#[command(version)]
struct Cli {
    /// Config file (TOML); FAILOVER__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the master
    Serve {
        /// Bind address for the admin API
        #[arg(long)]
        bind: Option<String>,

        /// Procedure log file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Durability of procedure log appends: always (fsync) or flush
        #[arg(long)]
        sync: Option<String>,

        /// Cluster seed file (JSON: assignments, live, segments)
        #[arg(long)]
        cluster: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file and environment, then override with CLI arguments
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            log,
            sync,
            cluster,
        } => {
            let mut master_config = config.master.clone();
            if let Some(bind) = bind {
                master_config.bind_addr = bind.parse()?;
            }
            if let Some(log) = log {
                master_config.log_path = log;
            }
            if let Some(sync) = sync {
                master_config.log_sync = match sync.as_str() {
                    "always" => LogSyncPolicy::Always,
                    "flush" => LogSyncPolicy::Flush,
                    other => anyhow::bail!("unknown sync policy: {}", other),
                };
            }
            master_config.validate()?;

            let cluster = match cluster {
                Some(path) => InMemoryCluster::from_file(&path)?,
                None => InMemoryCluster::new(),
            };

            tracing::info!("{} node {}", failover::BUILD_INFO, config.node_id);
            let master = Master::start(master_config, Collaborators::from_cluster(Arc::new(cluster))).await?;
            master.serve().await?;
        }
    }

    Ok(())
}
