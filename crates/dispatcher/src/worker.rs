//! Worker runtime: claims jobs for one process and executes them.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use durq_core::{Completion, Job, NewProcess, ProcessId, ProcessKind, QueueError, QueueResult};
use durq_store::QueueStore;

use crate::config::WorkerConfig;
use crate::handler::HandlerRegistry;
use crate::heartbeat;

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failures that were scheduled for another attempt.
    pub jobs_retried: u64,
    /// Failures that exhausted the retry budget.
    pub jobs_failed: u64,
    /// Completions the store ignored because the job was reaped meanwhile.
    pub jobs_ignored: u64,
    pub current_running: usize,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

/// Polls the store for claimable jobs and executes them with bounded
/// concurrency.
pub struct Worker {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    supervisor_id: Option<ProcessId>,
}

impl Worker {
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            registry,
            config,
            supervisor_id: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    /// Register the worker process and start polling until `shutdown` fires.
    pub async fn start(self, shutdown: CancellationToken) -> QueueResult<WorkerHandle> {
        let mut process = NewProcess::new(ProcessKind::Worker, &self.config.name).with_metadata(
            serde_json::json!({
                "queues": self.config.queues.patterns(),
                "batch_size": self.config.batch_size,
                "max_concurrent": self.config.max_concurrent,
            }),
        );
        if let Some(supervisor_id) = self.supervisor_id {
            process = process.with_supervisor(supervisor_id);
        }
        let process = self.store.register(process).await?;

        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let token = shutdown.child_token();
        let heartbeat = heartbeat::spawn(
            self.store.clone(),
            process.id,
            self.config.heartbeat_interval,
            token.clone(),
        );

        let join = tokio::spawn(
            worker_loop(self, process.id, token.clone(), stats.clone())
                .instrument(info_span!("worker", process_id = %process.id)),
        );

        Ok(WorkerHandle {
            process_id: process.id,
            shutdown: token,
            heartbeat,
            join,
            stats,
        })
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    process_id: ProcessId,
    shutdown: CancellationToken,
    heartbeat: JoinHandle<()>,
    join: JoinHandle<QueueResult<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Stop polling, wait for in-flight jobs, then deregister.
    pub async fn shutdown(self) -> QueueResult<WorkerStats> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait for the worker to stop on its own (shutdown token or a fatal error).
    pub async fn wait(self) -> QueueResult<WorkerStats> {
        let result = match self.join.await {
            Ok(result) => result,
            Err(err) => Err(QueueError::storage(format!("worker task failed: {err}"))),
        };
        self.shutdown.cancel();
        let _ = self.heartbeat.await;
        result?;
        Ok(lock(&self.stats).clone())
    }
}

async fn worker_loop(
    worker: Worker,
    process_id: ProcessId,
    shutdown: CancellationToken,
    stats: Arc<Mutex<WorkerStats>>,
) -> QueueResult<()> {
    let Worker {
        store,
        registry,
        config,
        ..
    } = worker;
    info!(worker = %config.name, "worker started");
    let started = Instant::now();
    let mut running: JoinSet<Outcome> = JoinSet::new();
    let mut fatal = None;

    while !shutdown.is_cancelled() {
        while let Some(done) = running.try_join_next() {
            record(&stats, done);
        }
        {
            let mut s = lock(&stats);
            s.uptime_secs = started.elapsed().as_secs();
            s.current_running = running.len();
        }

        let free = config
            .max_concurrent
            .max(1)
            .saturating_sub(running.len())
            .min(config.batch_size.max(1));
        if free == 0 {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(done) = running.join_next() => record(&stats, done),
            }
            continue;
        }

        match store.claim(process_id, &config.queues, free).await {
            Ok(batch) if batch.claimed.is_empty() => {
                idle(&shutdown, config.poll_interval).await;
            }
            Ok(batch) => {
                debug!(
                    worker = %config.name,
                    claimed = batch.claimed.len(),
                    blocked = batch.blocked.len(),
                    "claimed jobs"
                );
                for job in batch.claimed {
                    let span = info_span!("job", job_id = %job.id, class = %job.class_name, queue = %job.queue_name);
                    running.spawn(
                        execute_job(store.clone(), registry.clone(), job).instrument(span),
                    );
                }
            }
            Err(QueueError::NotFound(missing)) => {
                error!(worker = %config.name, %missing, "worker process was reaped; stopping");
                fatal = Some(QueueError::NotFound(missing));
                break;
            }
            Err(e) => {
                lock(&stats).store_errors += 1;
                if e.is_transient() {
                    warn!(worker = %config.name, error = %e, "claim failed, backing off");
                } else {
                    error!(worker = %config.name, error = %e, "claim failed");
                }
                idle(&shutdown, config.poll_interval).await;
            }
        }
    }

    while let Some(done) = running.join_next().await {
        record(&stats, done);
    }
    lock(&stats).current_running = 0;

    if let Some(err) = fatal {
        return Err(err);
    }
    let returned = store.deregister(process_id).await?;
    info!(worker = %config.name, returned = returned.len(), "worker stopped");
    Ok(())
}

async fn idle(shutdown: &CancellationToken, interval: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(interval) => {}
    }
}

#[derive(Debug)]
enum Outcome {
    Reported(Completion),
    /// Execution happened but the result could not be stored.
    Lost(QueueError),
    /// The job was taken away before it started.
    Skipped,
}

async fn execute_job(store: Arc<dyn QueueStore>, registry: Arc<HandlerRegistry>, job: Job) -> Outcome {
    let id = job.id;
    match report(|| store.mark_performed(id)).await {
        Ok(_) => {}
        Err(QueueError::InvalidState(reason)) => {
            debug!(%reason, "job no longer runnable");
            return Outcome::Skipped;
        }
        Err(e) => return Outcome::Lost(e),
    }

    let result = registry.execute(job).await;
    let reported = match &result {
        Ok(()) => report(|| store.mark_finished(id)).await,
        Err(error) => {
            debug!(error = %error.message, "job failed");
            report(|| store.mark_failed(id, error)).await
        }
    };

    match reported {
        Ok(completion) => Outcome::Reported(completion),
        Err(e) => Outcome::Lost(e),
    }
}

/// Retry a store call while it reports a transient error.
async fn report<T, F, Fut>(mut call: F) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = QueueResult<T>>,
{
    const ATTEMPTS: u32 = 5;
    let mut delay = Duration::from_millis(20);
    let mut attempt = 1;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt < ATTEMPTS => {
                warn!(error = %e, attempt, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn record(stats: &Mutex<WorkerStats>, done: Result<Outcome, tokio::task::JoinError>) {
    let mut s = lock(stats);
    match done {
        Ok(Outcome::Reported(completion)) => {
            s.jobs_processed += 1;
            match completion {
                Completion::Finished => s.jobs_succeeded += 1,
                Completion::Retrying { .. } => s.jobs_retried += 1,
                Completion::Failed => s.jobs_failed += 1,
                Completion::Ignored => s.jobs_ignored += 1,
            }
        }
        Ok(Outcome::Lost(error)) => {
            error!(%error, "job result was not recorded");
            s.store_errors += 1;
        }
        Ok(Outcome::Skipped) => {}
        Err(err) => {
            error!(error = %err, "job task aborted");
            s.store_errors += 1;
        }
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
