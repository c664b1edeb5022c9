//! Maintenance loop: promotes due jobs and recovers from dead processes.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use durq_core::{
    Clock, JobId, NewProcess, ProcessId, ProcessKind, QueueError, QueueResult, ReapReport,
    SemaphoreExpiry, SystemClock, clock,
};
use durq_store::QueueStore;

use crate::config::DispatcherConfig;
use crate::heartbeat;

/// What one maintenance tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: Vec<JobId>,
    pub reaped: ReapReport,
    pub released_blocks: Vec<JobId>,
    pub expired_semaphores: SemaphoreExpiry,
    pub purged: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.promoted.is_empty()
            && self.reaped.processes.is_empty()
            && self.released_blocks.is_empty()
            && self.expired_semaphores.keys.is_empty()
            && self.purged == 0
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub promoted: u64,
    pub processes_reaped: u64,
    pub blocks_released: u64,
    pub semaphores_expired: u64,
    pub purged: u64,
    pub tick_errors: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    supervisor_id: Option<ProcessId>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn QueueStore>, config: DispatcherConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            supervisor_id: None,
        }
    }

    /// Clock used for the finished-job retention cutoff.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_supervisor(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    /// Run one maintenance pass.
    ///
    /// Order matters: due jobs are promoted first, then dead processes are
    /// reaped (which frees slots and may unblock waiters), then expired blocks
    /// and orphaned semaphores are cleaned up.
    pub async fn tick(&self) -> QueueResult<TickReport> {
        let promoted = self.store.promote_scheduled().await?;
        let reaped = self.store.reap(self.config.stale_after).await?;
        let released_blocks = self.store.release_expired_blocks().await?;
        let expired_semaphores = self.store.expire_semaphores().await?;
        let purged = match self.config.finished_retention {
            Some(retention) => {
                let cutoff = clock::before(self.clock.now(), retention);
                self.store.purge_finished(cutoff).await?
            }
            None => 0,
        };

        Ok(TickReport {
            promoted,
            reaped,
            released_blocks,
            expired_semaphores,
            purged,
        })
    }

    /// Register the dispatcher process and tick until `shutdown` fires.
    pub async fn start(self, shutdown: CancellationToken) -> QueueResult<DispatcherHandle> {
        self.config.validate()?;
        let mut process = NewProcess::new(ProcessKind::Dispatcher, &self.config.name)
            .with_metadata(serde_json::json!({
                "polling_interval_ms": self.config.polling_interval.as_millis() as u64,
                "stale_after_secs": self.config.stale_after.as_secs(),
            }));
        if let Some(supervisor_id) = self.supervisor_id {
            process = process.with_supervisor(supervisor_id);
        }
        let process = self.store.register(process).await?;

        let token = shutdown.child_token();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let heartbeat = heartbeat::spawn(
            self.store.clone(),
            process.id,
            self.config.heartbeat_interval,
            token.clone(),
        );
        let join = tokio::spawn(
            dispatcher_loop(self, process.id, token.clone(), stats.clone())
                .instrument(info_span!("dispatcher", process_id = %process.id)),
        );

        Ok(DispatcherHandle {
            process_id: process.id,
            shutdown: token,
            heartbeat,
            join,
            stats,
        })
    }
}

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    process_id: ProcessId,
    shutdown: CancellationToken,
    heartbeat: JoinHandle<()>,
    join: JoinHandle<QueueResult<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn stats(&self) -> DispatcherStats {
        lock(&self.stats).clone()
    }

    pub async fn shutdown(self) -> QueueResult<DispatcherStats> {
        self.shutdown.cancel();
        let result = match self.join.await {
            Ok(result) => result,
            Err(err) => Err(QueueError::storage(format!("dispatcher task failed: {err}"))),
        };
        let _ = self.heartbeat.await;
        result?;
        Ok(lock(&self.stats).clone())
    }
}

async fn dispatcher_loop(
    dispatcher: Dispatcher,
    process_id: ProcessId,
    shutdown: CancellationToken,
    stats: Arc<Mutex<DispatcherStats>>,
) -> QueueResult<()> {
    info!(dispatcher = %dispatcher.config.name, "dispatcher started");

    loop {
        match dispatcher.tick().await {
            Ok(report) => {
                if !report.is_idle() {
                    debug!(
                        promoted = report.promoted.len(),
                        reaped = report.reaped.processes.len(),
                        requeued = report.reaped.requeued.len(),
                        released = report.released_blocks.len(),
                        purged = report.purged,
                        "maintenance tick"
                    );
                }
                let mut s = lock(&stats);
                s.ticks += 1;
                s.promoted += report.promoted.len() as u64;
                s.processes_reaped += report.reaped.processes.len() as u64;
                s.blocks_released += report.released_blocks.len() as u64;
                s.semaphores_expired += report.expired_semaphores.keys.len() as u64;
                s.purged += report.purged as u64;
                s.last_tick_at = Some(dispatcher.clock.now());
            }
            Err(e) => {
                lock(&stats).tick_errors += 1;
                if e.is_transient() {
                    warn!(error = %e, "maintenance tick failed, will retry");
                } else {
                    error!(error = %e, "maintenance tick failed");
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(dispatcher.config.polling_interval) => {}
        }
    }

    dispatcher.store.deregister(process_id).await?;
    info!(dispatcher = %dispatcher.config.name, "dispatcher stopped");
    Ok(())
}

fn lock(stats: &Mutex<DispatcherStats>) -> std::sync::MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
