//! Storage abstraction shared by every backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use durq_core::{
    ClaimBatch, Completion, ExecutionError, IndexCounts, Job, JobId, NewJob, NewProcess, Process,
    ProcessId, QueueResult, QueueSelector, ReapReport, Semaphore, SemaphoreExpiry,
};

/// Durable queue store.
///
/// Every method is one atomic transition: either all of its row changes are
/// visible to other callers or none are.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // --- job store -------------------------------------------------------

    /// Validate and persist a job plus its first index entry.
    async fn enqueue(&self, job: NewJob) -> QueueResult<Job>;

    /// Current record and status of a job.
    async fn job(&self, id: JobId) -> QueueResult<Job>;

    /// Delete a ready, scheduled, blocked or paused job.
    async fn cancel(&self, id: JobId) -> QueueResult<Job>;

    /// Record that a worker started executing a claimed job.
    async fn mark_performed(&self, id: JobId) -> QueueResult<Job>;

    /// Record success, drop the claim and release the concurrency slot.
    async fn mark_finished(&self, id: JobId) -> QueueResult<Completion>;

    /// Record a failure and either schedule a retry or fail permanently.
    async fn mark_failed(&self, id: JobId, error: &ExecutionError) -> QueueResult<Completion>;

    // --- dispatch index --------------------------------------------------

    async fn promote_scheduled(&self) -> QueueResult<Vec<JobId>>;

    /// Peek at the next ready jobs in dispatch order without claiming them.
    async fn select_next_ready(&self, selector: &QueueSelector, limit: usize)
    -> QueueResult<Vec<Job>>;

    /// Claim up to `limit` ready jobs for a registered process.
    async fn claim(
        &self,
        process_id: ProcessId,
        selector: &QueueSelector,
        limit: usize,
    ) -> QueueResult<ClaimBatch>;

    // --- concurrency limiter ---------------------------------------------

    async fn try_acquire(&self, key: &str, ttl: Duration) -> QueueResult<bool>;

    /// Return one slot and unblock the best-ranked waiter, if any.
    async fn release(&self, key: &str) -> QueueResult<Option<JobId>>;

    async fn semaphore(&self, key: &str) -> QueueResult<Option<Semaphore>>;

    async fn release_expired_blocks(&self) -> QueueResult<Vec<JobId>>;

    async fn expire_semaphores(&self) -> QueueResult<SemaphoreExpiry>;

    // --- process registry ------------------------------------------------

    async fn register(&self, process: NewProcess) -> QueueResult<Process>;

    async fn heartbeat(&self, id: ProcessId) -> QueueResult<()>;

    /// Clean shutdown: return claimed jobs to ready and delete the process.
    async fn deregister(&self, id: ProcessId) -> QueueResult<Vec<JobId>>;

    /// Reclaim work from processes silent for longer than `stale_after`.
    async fn reap(&self, stale_after: Duration) -> QueueResult<ReapReport>;

    async fn processes(&self) -> QueueResult<Vec<Process>>;

    // --- operator surface ------------------------------------------------

    async fn pause(&self, queue_name: &str) -> QueueResult<usize>;

    async fn resume(&self, queue_name: &str) -> QueueResult<usize>;

    async fn paused_queues(&self) -> QueueResult<Vec<String>>;

    async fn list_failed(&self, limit: usize) -> QueueResult<Vec<Job>>;

    async fn retry_failed(&self, id: JobId) -> QueueResult<Job>;

    async fn discard_failed(&self, id: JobId) -> QueueResult<Job>;

    /// Delete finished jobs completed before `before`.
    async fn purge_finished(&self, before: DateTime<Utc>) -> QueueResult<usize>;

    async fn counts(&self) -> QueueResult<IndexCounts>;
}

#[async_trait]
impl<S: QueueStore + ?Sized> QueueStore for Arc<S> {
    async fn enqueue(&self, job: NewJob) -> QueueResult<Job> {
        (**self).enqueue(job).await
    }

    async fn job(&self, id: JobId) -> QueueResult<Job> {
        (**self).job(id).await
    }

    async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        (**self).cancel(id).await
    }

    async fn mark_performed(&self, id: JobId) -> QueueResult<Job> {
        (**self).mark_performed(id).await
    }

    async fn mark_finished(&self, id: JobId) -> QueueResult<Completion> {
        (**self).mark_finished(id).await
    }

    async fn mark_failed(&self, id: JobId, error: &ExecutionError) -> QueueResult<Completion> {
        (**self).mark_failed(id, error).await
    }

    async fn promote_scheduled(&self) -> QueueResult<Vec<JobId>> {
        (**self).promote_scheduled().await
    }

    async fn select_next_ready(
        &self,
        selector: &QueueSelector,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        (**self).select_next_ready(selector, limit).await
    }

    async fn claim(
        &self,
        process_id: ProcessId,
        selector: &QueueSelector,
        limit: usize,
    ) -> QueueResult<ClaimBatch> {
        (**self).claim(process_id, selector, limit).await
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        (**self).try_acquire(key, ttl).await
    }

    async fn release(&self, key: &str) -> QueueResult<Option<JobId>> {
        (**self).release(key).await
    }

    async fn semaphore(&self, key: &str) -> QueueResult<Option<Semaphore>> {
        (**self).semaphore(key).await
    }

    async fn release_expired_blocks(&self) -> QueueResult<Vec<JobId>> {
        (**self).release_expired_blocks().await
    }

    async fn expire_semaphores(&self) -> QueueResult<SemaphoreExpiry> {
        (**self).expire_semaphores().await
    }

    async fn register(&self, process: NewProcess) -> QueueResult<Process> {
        (**self).register(process).await
    }

    async fn heartbeat(&self, id: ProcessId) -> QueueResult<()> {
        (**self).heartbeat(id).await
    }

    async fn deregister(&self, id: ProcessId) -> QueueResult<Vec<JobId>> {
        (**self).deregister(id).await
    }

    async fn reap(&self, stale_after: Duration) -> QueueResult<ReapReport> {
        (**self).reap(stale_after).await
    }

    async fn processes(&self) -> QueueResult<Vec<Process>> {
        (**self).processes().await
    }

    async fn pause(&self, queue_name: &str) -> QueueResult<usize> {
        (**self).pause(queue_name).await
    }

    async fn resume(&self, queue_name: &str) -> QueueResult<usize> {
        (**self).resume(queue_name).await
    }

    async fn paused_queues(&self) -> QueueResult<Vec<String>> {
        (**self).paused_queues().await
    }

    async fn list_failed(&self, limit: usize) -> QueueResult<Vec<Job>> {
        (**self).list_failed(limit).await
    }

    async fn retry_failed(&self, id: JobId) -> QueueResult<Job> {
        (**self).retry_failed(id).await
    }

    async fn discard_failed(&self, id: JobId) -> QueueResult<Job> {
        (**self).discard_failed(id).await
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> QueueResult<usize> {
        (**self).purge_finished(before).await
    }

    async fn counts(&self) -> QueueResult<IndexCounts> {
        (**self).counts().await
    }
}
