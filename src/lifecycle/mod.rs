//! Explicit start/stop of a store around a tokio runtime.
//!
//! `start` opens (and recovers) the store, declares the configured entities and
//! spawns a maintenance task that flushes journals on an interval. `stop` ends
//! that task and performs a final flush.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::config::{ConfigError, StoreConfig};
use crate::core::error::StoreError;
use crate::core::store::Store;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(String),
}

/// How a stopped store ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Failed(String),
}

#[derive(Debug)]
pub struct StoreHandle {
    store: Arc<Store>,
    shutdown_tx: watch::Sender<bool>,
    maintenance: JoinHandle<()>,
}

impl StoreHandle {
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Drop the store without flushing or closing anything, as a process crash
    /// would.
    pub fn crash(self) {
        self.maintenance.abort();
        warn!(dir = %self.store.dir().display(), "store dropped without shutdown");
    }
}

pub async fn start(config: StoreConfig) -> Result<StoreHandle, LifecycleError> {
    let options = config.store_options()?;
    let declared = config.clone();
    let store = tokio::task::spawn_blocking(move || -> Result<Store, StoreError> {
        let store = Store::open(options)?;
        for exchange in declared.exchanges {
            store.declare_exchange(exchange)?;
        }
        for queue in declared.queues {
            store.declare_queue(queue)?;
        }
        Ok(store)
    })
    .await
    .map_err(|e| LifecycleError::Task(e.to_string()))??;
    let store = Arc::new(store);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let maintenance_store = Arc::clone(&store);
    let period = Duration::from_millis(config.flush_interval_ms.max(1));
    let maintenance = tokio::spawn(async move {
        let mut interval = time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let store = Arc::clone(&maintenance_store);
                    match tokio::task::spawn_blocking(move || store.flush()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(error = %err, "periodic flush failed"),
                        Err(err) => error!(error = %err, "flush task panicked"),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });

    info!(
        dir = %config.dir.display(),
        flush_interval_ms = config.flush_interval_ms,
        "store started"
    );
    Ok(StoreHandle {
        store,
        shutdown_tx,
        maintenance,
    })
}

pub async fn stop(handle: StoreHandle) -> ExitStatus {
    let StoreHandle {
        store,
        shutdown_tx,
        maintenance,
    } = handle;
    let _ = shutdown_tx.send(true);
    if let Err(err) = maintenance.await {
        return ExitStatus::Failed(format!("maintenance task: {err}"));
    }
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(Ok(())) => {
            info!("store stopped");
            ExitStatus::Clean
        }
        Ok(Err(err)) => {
            error!(error = %err, "final flush failed");
            ExitStatus::Failed(err.to_string())
        }
        Err(err) => ExitStatus::Failed(format!("final flush task: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::QueueDecl;
    use crate::core::message::Message;

    fn config(dir: &std::path::Path) -> StoreConfig {
        StoreConfig {
            dir: dir.to_path_buf(),
            flush_interval_ms: 10,
            queues: vec![QueueDecl::new("q").durable(true)],
            num_jfiles: 4,
            jfile_size_pgs: 1,
            ..StoreConfig::default()
        }
    }

    #[tokio::test]
    async fn start_declares_and_stop_is_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = start(config(tmp.path())).await.unwrap();
        handle
            .store()
            .accept("q", &Message::new(&b"x"[..]).durable(true), None)
            .unwrap();
        assert_eq!(stop(handle).await, ExitStatus::Clean);

        let handle = start(config(tmp.path())).await.unwrap();
        assert_eq!(handle.store().query_queue("q").unwrap().depth, 1);
        handle.crash();
    }
}
