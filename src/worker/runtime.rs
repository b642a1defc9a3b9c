//! Dispatch runtime — wires the queue, dispatcher and worker pool under one
//! cancellation token and shuts them down within a grace period.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DispatchConfig;
use crate::error::{ConfigError, RuntimeError};
use crate::notify::Notifier;
use crate::store::traits::TaskStore;
use crate::worker::dispatcher::{Dispatcher, DispatcherState};
use crate::worker::queue::TaskQueue;
use crate::worker::stats::{DispatchStats, DispatchStatsSnapshot};
use crate::worker::worker::{WorkerDeps, spawn_workers};

/// Handle to a running dispatcher and worker pool.
pub struct DispatchRuntime {
    cancel: CancellationToken,
    queue: Arc<TaskQueue>,
    stats: Arc<DispatchStats>,
    dispatcher: Arc<Dispatcher>,
    handles: Vec<JoinHandle<()>>,
}

impl DispatchRuntime {
    /// Validate `config` and spawn the dispatcher plus `config.workers` workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: DispatchConfig,
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let queue = TaskQueue::new(config.queue_capacity);
        let stats = Arc::new(DispatchStats::default());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&notifier),
            Arc::clone(&stats),
            config.clone(),
        ));

        let workers = config.workers;
        let deps = WorkerDeps {
            store,
            queue: Arc::clone(&queue),
            notifier,
            stats: Arc::clone(&stats),
            config,
        };

        let mut handles = vec![Arc::clone(&dispatcher).spawn(cancel.clone())];
        handles.extend(spawn_workers(deps, workers, cancel.clone()));

        info!(workers, capacity = queue.capacity(), "Dispatch runtime started");

        Ok(Self {
            cancel,
            queue,
            stats,
            dispatcher,
            handles,
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    /// The shared token. Cancelling it stops every loop without waiting.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and wait up to `grace` for them to exit.
    ///
    /// Loops still running after `grace` are aborted and reported.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), RuntimeError> {
        info!(grace_ms = grace.as_millis() as u64, "Shutting down dispatch runtime");
        self.cancel.cancel();

        let mut handles = std::mem::take(&mut self.handles);
        let joined = tokio::time::timeout(grace, join_all(handles.iter_mut())).await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        if e.is_panic() {
                            return Err(RuntimeError::Panicked(e.to_string()));
                        }
                    }
                }
                info!("Dispatch runtime stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = handles.iter().filter(|h| !h.is_finished()).count();
                for handle in &handles {
                    handle.abort();
                }
                warn!(remaining, "Shutdown grace period elapsed, aborting loops");
                Err(RuntimeError::ShutdownTimeout { remaining, grace })
            }
        }
    }
}

impl Drop for DispatchRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
