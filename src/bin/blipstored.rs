//! BlipStore daemon.
//!
//! Opens the store described by the configuration, declares the configured
//! exchanges and queues, keeps journals flushed and shuts down on Ctrl+C.

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use blipstore::config::StoreConfig;
use blipstore::lifecycle::{self, ExitStatus};
use blipstore::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "blipstored", version, about = "BlipStore queue store daemon")]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = StoreConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_logging(config.log_filter.as_deref()).context("failed to install logger")?;

    let handle = lifecycle::start(config.clone())
        .await
        .with_context(|| format!("failed to start store in {}", config.dir.display()))?;
    let store = handle.store();
    for queue in store.list_queues()? {
        let info = store.query_queue(&queue.name)?;
        info!(
            queue = %queue.name,
            durable = queue.durable,
            depth = info.depth,
            paged = info.paged,
            "queue online"
        );
    }

    signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("shutdown requested");

    match lifecycle::stop(handle).await {
        ExitStatus::Clean => {
            info!("BlipStore daemon stopped cleanly");
            Ok(())
        }
        ExitStatus::Failed(reason) => {
            error!(%reason, "BlipStore daemon stopped with errors");
            anyhow::bail!("shutdown failed: {reason}")
        }
    }
}
