//! In-memory queue store for tests/dev.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use durq_core::{
    ClaimBatch, Clock, Completion, ExecutionError, IndexCounts, Job, JobId, NewJob, NewProcess,
    Process, ProcessId, QueueConfig, QueueError, QueueResult, QueueSelector, QueueState,
    ReapReport, Semaphore, SemaphoreExpiry, SystemClock,
};

use crate::store::QueueStore;

/// [`QueueStore`] over a [`QueueState`] behind one mutex.
///
/// Nothing survives the process; use it for tests and local development.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueStore {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::new(config)),
            clock,
        }
    }

    /// Verify index/status agreement and semaphore bounds.
    pub fn check_invariants(&self) -> QueueResult<()> {
        self.with_state(|state, _| state.check_invariants())?
            .map_err(QueueError::storage)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState, DateTime<Utc>) -> T) -> QueueResult<T> {
        let now = self.clock.now();
        let mut state = self
            .state
            .lock()
            .map_err(|_| QueueError::storage("queue state lock poisoned"))?;
        Ok(f(&mut state, now))
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    #[instrument(skip(self, job), fields(class = %job.class_name, queue = %job.queue_name), err)]
    async fn enqueue(&self, job: NewJob) -> QueueResult<Job> {
        self.with_state(|state, now| state.enqueue(job, now))?
    }

    async fn job(&self, id: JobId) -> QueueResult<Job> {
        self.with_state(|state, _| state.job(id))?
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        self.with_state(|state, _| state.cancel(id))?
    }

    #[instrument(skip(self), err)]
    async fn mark_performed(&self, id: JobId) -> QueueResult<Job> {
        self.with_state(|state, now| state.mark_performed(id, now))?
    }

    #[instrument(skip(self), err)]
    async fn mark_finished(&self, id: JobId) -> QueueResult<Completion> {
        self.with_state(|state, now| state.mark_finished(id, now))?
    }

    #[instrument(skip(self, error), err)]
    async fn mark_failed(&self, id: JobId, error: &ExecutionError) -> QueueResult<Completion> {
        self.with_state(|state, now| state.mark_failed(id, &error.message, now))?
    }

    async fn promote_scheduled(&self) -> QueueResult<Vec<JobId>> {
        self.with_state(|state, now| state.promote_scheduled(now))
    }

    async fn select_next_ready(
        &self,
        selector: &QueueSelector,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        self.with_state(|state, now| state.select_next_ready(selector, limit, now))
    }

    #[instrument(skip(self, selector), err)]
    async fn claim(
        &self,
        process_id: ProcessId,
        selector: &QueueSelector,
        limit: usize,
    ) -> QueueResult<ClaimBatch> {
        self.with_state(|state, now| state.claim(process_id, selector, limit, now))?
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        self.with_state(|state, now| state.try_acquire(key, ttl, now))
    }

    async fn release(&self, key: &str) -> QueueResult<Option<JobId>> {
        self.with_state(|state, now| state.release(key, now))
    }

    async fn semaphore(&self, key: &str) -> QueueResult<Option<Semaphore>> {
        self.with_state(|state, _| state.semaphore(key))
    }

    async fn release_expired_blocks(&self) -> QueueResult<Vec<JobId>> {
        self.with_state(|state, now| state.release_expired_blocks(now))
    }

    async fn expire_semaphores(&self) -> QueueResult<SemaphoreExpiry> {
        self.with_state(|state, now| state.expire_semaphores(now))
    }

    #[instrument(skip(self, process), fields(kind = %process.kind, name = %process.name), err)]
    async fn register(&self, process: NewProcess) -> QueueResult<Process> {
        self.with_state(|state, now| state.register(process, now))?
    }

    async fn heartbeat(&self, id: ProcessId) -> QueueResult<()> {
        self.with_state(|state, now| state.heartbeat(id, now))?
    }

    #[instrument(skip(self), err)]
    async fn deregister(&self, id: ProcessId) -> QueueResult<Vec<JobId>> {
        self.with_state(|state, now| state.deregister(id, now))?
    }

    #[instrument(skip(self), err)]
    async fn reap(&self, stale_after: Duration) -> QueueResult<ReapReport> {
        self.with_state(|state, now| state.reap(stale_after, now))
    }

    async fn processes(&self) -> QueueResult<Vec<Process>> {
        self.with_state(|state, _| state.processes())
    }

    #[instrument(skip(self), err)]
    async fn pause(&self, queue_name: &str) -> QueueResult<usize> {
        self.with_state(|state, now| state.pause(queue_name, now))?
    }

    #[instrument(skip(self), err)]
    async fn resume(&self, queue_name: &str) -> QueueResult<usize> {
        self.with_state(|state, now| state.resume(queue_name, now))
    }

    async fn paused_queues(&self) -> QueueResult<Vec<String>> {
        self.with_state(|state, _| state.paused_queues())
    }

    async fn list_failed(&self, limit: usize) -> QueueResult<Vec<Job>> {
        self.with_state(|state, _| state.list_failed(limit))
    }

    #[instrument(skip(self), err)]
    async fn retry_failed(&self, id: JobId) -> QueueResult<Job> {
        self.with_state(|state, now| state.retry_failed(id, now))?
    }

    #[instrument(skip(self), err)]
    async fn discard_failed(&self, id: JobId) -> QueueResult<Job> {
        self.with_state(|state, _| state.discard_failed(id))?
    }

    #[instrument(skip(self), err)]
    async fn purge_finished(&self, before: DateTime<Utc>) -> QueueResult<usize> {
        self.with_state(|state, _| state.purge_finished(before))
    }

    async fn counts(&self) -> QueueResult<IndexCounts> {
        self.with_state(|state, _| state.counts())
    }
}
