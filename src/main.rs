use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use task_dispatch::cache::spawn_sweeper;
use task_dispatch::config::{CacheConfig, DispatchConfig, seed_tasks_from_env};
use task_dispatch::notify::BroadcastNotifier;
use task_dispatch::store::{CachedTaskStore, LibSqlTaskStore, TaskStore};
use task_dispatch::tasks::NewTask;
use task_dispatch::worker::DispatchRuntime;

/// Time allowed for loops to exit after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatchConfig::from_env()?;
    let seed = seed_tasks_from_env()?;
    let cache_config = CacheConfig::default();
    cache_config.validate()?;

    let db_path =
        std::env::var("TASK_DISPATCH_DB_PATH").unwrap_or_else(|_| "./data/tasks.db".to_string());

    eprintln!("Task Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", db_path);
    eprintln!(
        "   Workers: {}  Queue: {}  Poll: {:?}",
        config.workers, config.queue_capacity, config.poll_interval
    );
    eprintln!("   Press Ctrl-C to stop.\n");

    // ── Database ─────────────────────────────────────────────────────────
    let store = LibSqlTaskStore::new_local(std::path::Path::new(&db_path))
        .await
        .with_context(|| format!("failed to open task database at {db_path}"))?;

    // Read-through cache in front of the database
    let store = CachedTaskStore::new(store, cache_config);
    let sweepers = CancellationToken::new();
    spawn_sweeper(Arc::clone(store.task_cache()), sweepers.clone());
    spawn_sweeper(Arc::clone(store.listing_cache()), sweepers.clone());
    let store: Arc<dyn TaskStore> = Arc::new(store);

    // Optional demo backlog
    for n in 1..=seed {
        store
            .create(NewTask::new("demo", format!("Demo task {n}")))
            .await
            .context("failed to seed demo task")?;
    }
    if seed > 0 {
        info!(count = seed, "Seeded demo tasks");
    }

    // ── Notifications ────────────────────────────────────────────────────
    let notifier = BroadcastNotifier::new();
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(e) => info!(
                    user_id = %e.user_id,
                    task_id = e.event.task_id,
                    status = %e.event.status,
                    "Task status changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Dispatch ─────────────────────────────────────────────────────────
    let runtime = DispatchRuntime::start(config, store, Arc::new(notifier))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C");

    let result = runtime.shutdown(SHUTDOWN_GRACE).await;
    sweepers.cancel();
    result?;
    Ok(())
}
