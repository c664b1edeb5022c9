use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use durq_dispatcher::{HandlerRegistry, RuntimeConfig, Supervisor, install_shutdown_handler};
use durq_store::{QueueStore, SqliteQueueStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    durq_observability::init();

    let config = RuntimeConfig::from_env();
    config.validate().context("invalid runtime configuration")?;
    info!(database = %config.database_url, "starting durq dispatcher");

    let store = SqliteQueueStore::connect(&config.database_url, config.queue.clone())
        .await
        .with_context(|| format!("failed to open queue database {}", config.database_url))?;
    let store: Arc<dyn QueueStore> = Arc::new(store);

    let shutdown = install_shutdown_handler();
    let supervisor = Supervisor::new(store.clone(), HandlerRegistry::new())
        .with_name(format!("{}-supervisor", config.dispatcher.name))
        .with_dispatcher(config.dispatcher.clone())
        .start(shutdown.clone())
        .await
        .context("failed to start supervisor")?;
    info!(
        supervisor_id = %supervisor.process_id(),
        dispatcher_id = ?supervisor.dispatcher_id(),
        workers = supervisor.worker_ids().len(),
        "supervisor running"
    );

    shutdown.cancelled().await;

    let report = supervisor
        .shutdown()
        .await
        .context("supervisor did not shut down cleanly")?;
    if let Some(stats) = report.dispatcher {
        info!(
            ticks = stats.ticks,
            promoted = stats.promoted,
            reaped = stats.processes_reaped,
            "dispatcher stopped"
        );
    }

    let counts = store.counts().await.context("failed to read queue counts")?;
    info!(?counts, "queue state at shutdown");
    Ok(())
}
