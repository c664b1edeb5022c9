//! Periodic process heartbeats.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use durq_core::{ProcessId, QueueError};
use durq_store::QueueStore;

/// Heartbeat `process_id` every `interval` until `shutdown` fires or the
/// process row disappears.
pub(crate) fn spawn(
    store: Arc<dyn QueueStore>,
    process_id: ProcessId,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match store.heartbeat(process_id).await {
                Ok(()) => debug!(%process_id, "heartbeat"),
                Err(QueueError::NotFound(_)) => {
                    warn!(%process_id, "process row is gone; stopping heartbeats");
                    break;
                }
                Err(error) => warn!(%process_id, %error, "heartbeat failed"),
            }
        }
    })
}
