//! In-memory queue state machine.
//!
//! `QueueState` owns every job, process and semaphore row and performs each
//! transition as a single `&mut self` call, so wrapping it in one mutex gives
//! the same atomicity the SQLite backend gets from transactions.
//!
//! Each job carries an explicit [`JobStatus`]; the sorted indexes below are
//! kept in lockstep with it by [`QueueState::transition`], which always
//! detaches a job from its current index before inserting it into the next.
//! Time is passed in by the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock;
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::id::{JobId, ProcessId};
use crate::job::{IndexCounts, Job, JobStatus, NewJob, Rank};
use crate::outcome::{ClaimBatch, Completion, ReapReport, SemaphoreExpiry};
use crate::process::{NewProcess, Process};
use crate::selector::QueueSelector;
use crate::semaphore::Semaphore;

#[derive(Debug, Clone, Copy)]
enum Placement {
    Ready,
    Scheduled(DateTime<Utc>),
    Claimed(ProcessId),
    Blocked { expires_at: DateTime<Utc> },
    Failed,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Default)]
pub struct QueueState {
    config: QueueConfig,
    last_job_id: i64,
    last_process_id: i64,
    jobs: BTreeMap<JobId, Job>,
    ready: BTreeSet<Rank>,
    scheduled: BTreeSet<(DateTime<Utc>, JobId)>,
    claimed: BTreeMap<JobId, ProcessId>,
    /// Blocked job -> expiry of the block.
    blocked: BTreeMap<JobId, DateTime<Utc>>,
    failed: BTreeSet<JobId>,
    paused: BTreeSet<JobId>,
    paused_queues: BTreeMap<String, DateTime<Utc>>,
    processes: BTreeMap<ProcessId, Process>,
    semaphores: BTreeMap<String, Semaphore>,
}

impl QueueState {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Job store
    // ---------------------------------------------------------------------

    pub fn enqueue(&mut self, new: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        new.validate()?;

        self.last_job_id += 1;
        let id = JobId::new(self.last_job_id);
        let job = Job::from_new(id, new, self.config.retry.max_attempts, now);
        let run_later = job.scheduled_at.filter(|at| *at > now);
        self.jobs.insert(id, job);

        match run_later {
            Some(at) => self.transition(id, Placement::Scheduled(at), now),
            None => self.make_available(id, now),
        }
        self.job(id)
    }

    pub fn job(&self, id: JobId) -> QueueResult<Job> {
        self.jobs
            .get(&id)
            .cloned()
            .ok_or(QueueError::job_not_found(id))
    }

    /// Delete a job that has not been handed to a worker yet.
    pub fn cancel(&mut self, id: JobId) -> QueueResult<Job> {
        let status = self.status_of(id)?;
        if !status.is_pending() {
            return Err(QueueError::invalid_state(format!(
                "job {id} is {status} and cannot be cancelled"
            )));
        }
        self.detach(id);
        self.jobs.remove(&id).ok_or(QueueError::job_not_found(id))
    }

    pub fn mark_performed(&mut self, id: JobId, now: DateTime<Utc>) -> QueueResult<Job> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(QueueError::job_not_found(id))?;
        if job.status != JobStatus::Claimed {
            return Err(QueueError::invalid_state(format!(
                "job {id} is {} and cannot start executing",
                job.status
            )));
        }
        if job.performed_at.is_some() {
            return Err(QueueError::invalid_state(format!(
                "job {id} was already marked performed"
            )));
        }
        job.performed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    pub fn mark_finished(&mut self, id: JobId, now: DateTime<Utc>) -> QueueResult<Completion> {
        let Some(key) = self.completable(id)? else {
            return Ok(Completion::Ignored);
        };

        if let Some(job) = self.jobs.get_mut(&id) {
            job.finished_at = Some(now);
        }
        self.transition(id, Placement::Finished, now);
        if let Some(key) = key {
            self.release(&key, now);
        }
        Ok(Completion::Finished)
    }

    pub fn mark_failed(
        &mut self,
        id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Completion> {
        let Some(key) = self.completable(id)? else {
            return Ok(Completion::Ignored);
        };

        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(QueueError::job_not_found(id))?;
        job.error_message = Some(message.to_string());

        let completion = if job.has_retries_left() {
            let delay = self.config.retry.delay_for_attempt(job.attempts);
            job.performed_at = None;
            if delay.is_zero() {
                self.make_available(id, now);
                Completion::Retrying { run_at: now }
            } else {
                let run_at = clock::after(now, delay);
                self.transition(id, Placement::Scheduled(run_at), now);
                Completion::Retrying { run_at }
            }
        } else {
            job.failed_at = Some(now);
            self.transition(id, Placement::Failed, now);
            Completion::Failed
        };

        if let Some(key) = key {
            self.release(&key, now);
        }
        Ok(completion)
    }

    /// Checks shared by both completion reports.
    ///
    /// `Ok(None)` means the report must be ignored; otherwise the job's
    /// concurrency key is returned so its slot can be released.
    fn completable(&self, id: JobId) -> QueueResult<Option<Option<String>>> {
        let job = self.jobs.get(&id).ok_or(QueueError::job_not_found(id))?;
        if !job.accepts_completion()? {
            debug!(job_id = %id, status = %job.status, "ignoring completion for unclaimed job");
            return Ok(None);
        }
        Ok(Some(job.concurrency_key.clone()))
    }

    // ---------------------------------------------------------------------
    // Dispatch index
    // ---------------------------------------------------------------------

    /// Move every due scheduled job to ready (or paused).
    pub fn promote_scheduled(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let due: Vec<JobId> = self
            .scheduled
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, id)| *id)
            .collect();

        for id in &due {
            self.make_available(*id, now);
        }
        due
    }

    /// Up to `limit` ready jobs in dispatch order.
    ///
    /// Jobs whose concurrency key is saturated and already has waiters are
    /// skipped; they stay ready until a slot frees up.
    pub fn select_next_ready(
        &self,
        selector: &QueueSelector,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<Job> {
        let mut picked = Vec::with_capacity(limit.min(self.ready.len()));
        for rank in &self.ready {
            if picked.len() >= limit {
                break;
            }
            let Some(job) = self.jobs.get(&rank.job_id()) else {
                continue;
            };
            if !selector.matches(&job.queue_name) {
                continue;
            }
            if let Some(key) = job.concurrency_key.as_deref() {
                if self.key_is_blocked(key, now) {
                    continue;
                }
            }
            picked.push(job.clone());
        }
        picked
    }

    /// Claim up to `limit` ready jobs for `process_id`.
    ///
    /// Candidates whose concurrency key has no free slot are moved to blocked
    /// instead of being claimed.
    pub fn claim(
        &mut self,
        process_id: ProcessId,
        selector: &QueueSelector,
        limit: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<ClaimBatch> {
        if !self.processes.contains_key(&process_id) {
            return Err(QueueError::process_not_found(process_id));
        }

        let mut batch = ClaimBatch::default();
        for candidate in self.select_next_ready(selector, limit, now) {
            let acquired = match candidate.concurrency_key.as_deref() {
                Some(key) => self.try_acquire(key, self.config.concurrency.ttl, now),
                None => true,
            };

            if acquired {
                self.transition(candidate.id, Placement::Claimed(process_id), now);
                if let Some(job) = self.jobs.get_mut(&candidate.id) {
                    job.attempts += 1;
                    batch.claimed.push(job.clone());
                }
            } else {
                let expires_at = clock::after(now, self.config.concurrency.ttl);
                self.transition(candidate.id, Placement::Blocked { expires_at }, now);
                debug!(job_id = %candidate.id, "job blocked on concurrency key");
                batch.blocked.push(candidate.id);
            }
        }
        Ok(batch)
    }

    /// A key is blocked while it has an unexpired waiter and no free slot.
    fn key_is_blocked(&self, key: &str, now: DateTime<Utc>) -> bool {
        let saturated = self.semaphores.get(key).is_some_and(|s| s.value == 0);
        saturated
            && self.blocked.iter().any(|(id, expires_at)| {
                *expires_at > now && self.key_of(*id).is_some_and(|k| k == key)
            })
    }

    // ---------------------------------------------------------------------
    // Concurrency limiter
    // ---------------------------------------------------------------------

    /// Take a slot for `key`, holding it until at least `now + ttl`.
    pub fn try_acquire(&mut self, key: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        let capacity = self.config.concurrency.capacity_for(key);
        let expires_at = clock::after(now, ttl);

        match self.semaphores.get_mut(key) {
            None => {
                self.semaphores.insert(
                    key.to_string(),
                    Semaphore {
                        key: key.to_string(),
                        value: capacity - 1,
                        expires_at,
                    },
                );
                true
            }
            Some(semaphore) if semaphore.value > 0 => {
                semaphore.value -= 1;
                semaphore.expires_at = expires_at;
                true
            }
            Some(_) => false,
        }
    }

    /// Return a slot for `key` and wake the best-ranked job waiting on it.
    pub fn release(&mut self, key: &str, now: DateTime<Utc>) -> Option<JobId> {
        let capacity = self.config.concurrency.capacity_for(key);
        if let Some(semaphore) = self.semaphores.get_mut(key) {
            semaphore.value = (semaphore.value + 1).min(capacity);
        }
        self.unblock_next(key, now)
    }

    pub fn semaphore(&self, key: &str) -> Option<Semaphore> {
        self.semaphores.get(key).cloned()
    }

    fn unblock_next(&mut self, key: &str, now: DateTime<Utc>) -> Option<JobId> {
        let next = self
            .blocked
            .keys()
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| job.concurrency_key.as_deref() == Some(key))
            .map(Job::rank)
            .min()?;

        self.make_available(next.job_id(), now);
        Some(next.job_id())
    }

    /// Move blocked jobs whose block expired back to ready.
    pub fn release_expired_blocks(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .blocked
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.make_available(*id, now);
        }
        expired
    }

    /// Delete expired semaphores nobody holds and release their waiters.
    pub fn expire_semaphores(&mut self, now: DateTime<Utc>) -> SemaphoreExpiry {
        let keys: Vec<String> = self
            .semaphores
            .values()
            .filter(|s| s.is_expired(now) && !self.key_has_holder(&s.key))
            .map(|s| s.key.clone())
            .collect();

        let mut unblocked = Vec::new();
        for key in &keys {
            self.semaphores.remove(key);
            for _ in 0..self.config.concurrency.capacity_for(key) {
                match self.unblock_next(key, now) {
                    Some(id) => unblocked.push(id),
                    None => break,
                }
            }
        }
        SemaphoreExpiry { keys, unblocked }
    }

    fn key_has_holder(&self, key: &str) -> bool {
        self.claimed
            .keys()
            .any(|id| self.key_of(*id).is_some_and(|k| k == key))
    }

    fn key_of(&self, id: JobId) -> Option<&str> {
        self.jobs.get(&id).and_then(|j| j.concurrency_key.as_deref())
    }

    // ---------------------------------------------------------------------
    // Process registry
    // ---------------------------------------------------------------------

    pub fn register(&mut self, new: NewProcess, now: DateTime<Utc>) -> QueueResult<Process> {
        if let Some(supervisor_id) = new.supervisor_id {
            if !self.processes.contains_key(&supervisor_id) {
                return Err(QueueError::process_not_found(supervisor_id));
            }
        }

        self.last_process_id += 1;
        let id = ProcessId::new(self.last_process_id);
        let process = Process::from_new(id, new, now);
        self.processes.insert(id, process.clone());
        Ok(process)
    }

    pub fn heartbeat(&mut self, id: ProcessId, now: DateTime<Utc>) -> QueueResult<()> {
        let process = self
            .processes
            .get_mut(&id)
            .ok_or(QueueError::process_not_found(id))?;
        process.last_heartbeat_at = now;
        Ok(())
    }

    /// Clean shutdown: hand back claimed jobs and remove the process.
    ///
    /// Jobs that never started executing get their attempt back.
    pub fn deregister(&mut self, id: ProcessId, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        if !self.processes.contains_key(&id) {
            return Err(QueueError::process_not_found(id));
        }

        let returned = self.claimed_by(id);
        for job_id in &returned {
            let Some(job) = self.jobs.get_mut(job_id) else {
                continue;
            };
            if job.performed_at.is_none() {
                job.attempts = job.attempts.saturating_sub(1);
            }
            job.performed_at = None;
            let key = job.concurrency_key.clone();
            self.make_available(*job_id, now);
            if let Some(key) = key {
                self.release(&key, now);
            }
        }
        self.remove_process(id);
        Ok(returned)
    }

    /// Reclaim the work of processes that stopped heartbeating, then delete them.
    pub fn reap(&mut self, stale_after: Duration, now: DateTime<Utc>) -> ReapReport {
        let stale: Vec<ProcessId> = self
            .processes
            .values()
            .filter(|p| p.is_stale(now, stale_after))
            .map(|p| p.id)
            .collect();

        let mut report = ReapReport::default();
        for process_id in stale {
            for job_id in self.claimed_by(process_id) {
                let Some(job) = self.jobs.get_mut(&job_id) else {
                    continue;
                };
                let key = job.concurrency_key.clone();
                job.performed_at = None;
                if job.has_retries_left() {
                    self.make_available(job_id, now);
                    report.requeued.push(job_id);
                } else {
                    job.failed_at = Some(now);
                    job.error_message = Some(format!("process {process_id} stopped heartbeating"));
                    self.transition(job_id, Placement::Failed, now);
                    report.failed.push(job_id);
                }
                if let Some(key) = key {
                    self.release(&key, now);
                }
            }
            warn!(process_id = %process_id, "reaped stale process");
            self.remove_process(process_id);
            report.processes.push(process_id);
        }
        report
    }

    pub fn processes(&self) -> Vec<Process> {
        self.processes.values().cloned().collect()
    }

    fn claimed_by(&self, process_id: ProcessId) -> Vec<JobId> {
        self.claimed
            .iter()
            .filter(|(_, owner)| **owner == process_id)
            .map(|(id, _)| *id)
            .collect()
    }

    fn remove_process(&mut self, id: ProcessId) {
        self.processes.remove(&id);
        for process in self.processes.values_mut() {
            if process.supervisor_id == Some(id) {
                process.supervisor_id = None;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Operator surface
    // ---------------------------------------------------------------------

    /// Hold a queue; its ready jobs move to paused. Returns how many moved.
    pub fn pause(&mut self, queue_name: &str, now: DateTime<Utc>) -> QueueResult<usize> {
        if queue_name.trim().is_empty() {
            return Err(QueueError::validation("queue_name must not be empty"));
        }
        self.paused_queues.entry(queue_name.to_string()).or_insert(now);

        let held = self.ready_in_queue(queue_name);
        for id in &held {
            self.transition(*id, Placement::Paused, now);
        }
        Ok(held.len())
    }

    /// Release a paused queue. Returns how many jobs became ready.
    pub fn resume(&mut self, queue_name: &str, now: DateTime<Utc>) -> usize {
        self.paused_queues.remove(queue_name);

        let released: Vec<JobId> = self
            .paused
            .iter()
            .filter(|id| {
                self.jobs
                    .get(id)
                    .is_some_and(|job| job.queue_name == queue_name)
            })
            .copied()
            .collect();
        for id in &released {
            self.transition(*id, Placement::Ready, now);
        }
        released.len()
    }

    pub fn paused_queues(&self) -> Vec<String> {
        self.paused_queues.keys().cloned().collect()
    }

    pub fn list_failed(&self, limit: usize) -> Vec<Job> {
        self.failed
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Give a failed job a fresh retry budget.
    pub fn retry_failed(&mut self, id: JobId, now: DateTime<Utc>) -> QueueResult<Job> {
        self.expect_failed(id)?;
        if let Some(job) = self.jobs.get_mut(&id) {
            job.attempts = 0;
            job.failed_at = None;
            job.error_message = None;
            job.performed_at = None;
        }
        self.make_available(id, now);
        self.job(id)
    }

    pub fn discard_failed(&mut self, id: JobId) -> QueueResult<Job> {
        self.expect_failed(id)?;
        self.detach(id);
        self.jobs.remove(&id).ok_or(QueueError::job_not_found(id))
    }

    /// Delete finished jobs completed before `before`. Returns how many.
    pub fn purge_finished(&mut self, before: DateTime<Utc>) -> usize {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Finished && job.finished_at.is_some_and(|at| at < before)
            })
            .map(|job| job.id)
            .collect();

        for id in &expired {
            self.jobs.remove(id);
        }
        expired.len()
    }

    pub fn counts(&self) -> IndexCounts {
        IndexCounts {
            ready: self.ready.len(),
            scheduled: self.scheduled.len(),
            claimed: self.claimed.len(),
            blocked: self.blocked.len(),
            failed: self.failed.len(),
            paused: self.paused.len(),
            finished: self
                .jobs
                .values()
                .filter(|job| job.status == JobStatus::Finished)
                .count(),
        }
    }

    fn expect_failed(&self, id: JobId) -> QueueResult<()> {
        match self.status_of(id)? {
            JobStatus::Failed => Ok(()),
            other => Err(QueueError::invalid_state(format!(
                "job {id} is {other}, not failed"
            ))),
        }
    }

    fn ready_in_queue(&self, queue_name: &str) -> Vec<JobId> {
        self.ready
            .iter()
            .map(Rank::job_id)
            .filter(|id| {
                self.jobs
                    .get(id)
                    .is_some_and(|job| job.queue_name == queue_name)
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Index bookkeeping
    // ---------------------------------------------------------------------

    fn status_of(&self, id: JobId) -> QueueResult<JobStatus> {
        self.jobs
            .get(&id)
            .map(|job| job.status)
            .ok_or(QueueError::job_not_found(id))
    }

    /// Ready, unless the job's queue is paused.
    fn make_available(&mut self, id: JobId, now: DateTime<Utc>) {
        let held = self
            .jobs
            .get(&id)
            .is_some_and(|job| self.paused_queues.contains_key(&job.queue_name));
        let placement = if held { Placement::Paused } else { Placement::Ready };
        self.transition(id, placement, now);
    }

    fn transition(&mut self, id: JobId, to: Placement, now: DateTime<Utc>) {
        self.detach(id);
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };

        job.updated_at = now;
        job.status = match to {
            Placement::Ready => {
                self.ready.insert(job.rank());
                JobStatus::Ready
            }
            Placement::Scheduled(at) => {
                job.scheduled_at = Some(at);
                self.scheduled.insert((at, id));
                JobStatus::Scheduled
            }
            Placement::Claimed(process_id) => {
                self.claimed.insert(id, process_id);
                JobStatus::Claimed
            }
            Placement::Blocked { expires_at } => {
                self.blocked.insert(id, expires_at);
                JobStatus::Blocked
            }
            Placement::Failed => {
                self.failed.insert(id);
                JobStatus::Failed
            }
            Placement::Paused => {
                self.paused.insert(id);
                JobStatus::Paused
            }
            Placement::Finished => JobStatus::Finished,
        };
    }

    fn detach(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        match job.status {
            JobStatus::Ready => {
                self.ready.remove(&job.rank());
            }
            JobStatus::Scheduled => {
                if let Some(at) = job.scheduled_at {
                    self.scheduled.remove(&(at, id));
                }
            }
            JobStatus::Claimed => {
                self.claimed.remove(&id);
            }
            JobStatus::Blocked => {
                self.blocked.remove(&id);
            }
            JobStatus::Failed => {
                self.failed.remove(&id);
            }
            JobStatus::Paused => {
                self.paused.remove(&id);
            }
            JobStatus::Finished => {}
        }
    }

    /// Verify index/status agreement and semaphore bounds.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (id, job) in &self.jobs {
            let memberships = [
                (JobStatus::Ready, self.ready.contains(&job.rank())),
                (
                    JobStatus::Scheduled,
                    job.scheduled_at
                        .is_some_and(|at| self.scheduled.contains(&(at, *id))),
                ),
                (JobStatus::Claimed, self.claimed.contains_key(id)),
                (JobStatus::Blocked, self.blocked.contains_key(id)),
                (JobStatus::Failed, self.failed.contains(id)),
                (JobStatus::Paused, self.paused.contains(id)),
            ];
            let present: Vec<JobStatus> = memberships
                .iter()
                .filter(|(_, member)| *member)
                .map(|(status, _)| *status)
                .collect();

            let expected: &[JobStatus] = match job.status {
                JobStatus::Finished => &[],
                ref status => core::slice::from_ref(status),
            };
            if present != expected {
                return Err(format!(
                    "job {id} has status {} but is indexed as {present:?}",
                    job.status
                ));
            }
            if job.finished_at.is_some() && job.failed_at.is_some() {
                return Err(format!("job {id} is both finished and failed"));
            }
            if let (Some(scheduled), Some(performed)) = (job.scheduled_at, job.performed_at) {
                if performed < scheduled {
                    return Err(format!("job {id} performed before it was scheduled"));
                }
            }
        }

        let indexed = self.ready.len()
            + self.scheduled.len()
            + self.claimed.len()
            + self.blocked.len()
            + self.failed.len()
            + self.paused.len();
        let active = self
            .jobs
            .values()
            .filter(|job| job.status != JobStatus::Finished)
            .count();
        if indexed != active {
            return Err(format!("{indexed} index rows for {active} active jobs"));
        }

        for (job_id, owner) in &self.claimed {
            if !self.processes.contains_key(owner) {
                return Err(format!("job {job_id} is claimed by missing process {owner}"));
            }
        }

        let mut holders: BTreeMap<&str, u32> = BTreeMap::new();
        for id in self.claimed.keys() {
            if let Some(key) = self.key_of(*id) {
                *holders.entry(key).or_default() += 1;
            }
        }
        for (key, held) in &holders {
            let capacity = self.config.concurrency.capacity_for(key);
            match self.semaphores.get(*key) {
                Some(semaphore) if semaphore.value + held <= capacity => {}
                Some(semaphore) => {
                    return Err(format!(
                        "key {key}: {held} holders with {} free slots exceeds capacity {capacity}",
                        semaphore.value
                    ));
                }
                None => return Err(format!("key {key} has holders but no semaphore")),
            }
        }
        for semaphore in self.semaphores.values() {
            if semaphore.value > self.config.concurrency.capacity_for(&semaphore.key) {
                return Err(format!("semaphore {} above capacity", semaphore.key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::process::ProcessKind;
    use crate::retry::RetryPolicy;
    use crate::semaphore::ConcurrencyLimits;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn state_with(retry: RetryPolicy) -> QueueState {
        QueueState::new(QueueConfig::default().with_retry(retry))
    }

    fn worker(state: &mut QueueState) -> ProcessId {
        state
            .register(NewProcess::new(ProcessKind::Worker, "worker"), t0())
            .unwrap()
            .id
    }

    fn run(state: &mut QueueState, id: JobId, now: DateTime<Utc>) {
        state.mark_performed(id, now).unwrap();
        assert_eq!(state.mark_finished(id, now).unwrap(), Completion::Finished);
    }

    #[test]
    fn enqueue_routes_by_schedule() {
        let mut state = QueueState::default();

        let now_job = state.enqueue(NewJob::new("Mailer", "default"), t0()).unwrap();
        let later = state
            .enqueue(
                NewJob::new("Mailer", "default").scheduled_at(t0() + chrono::Duration::seconds(60)),
                t0(),
            )
            .unwrap();
        let past = state
            .enqueue(
                NewJob::new("Mailer", "default").scheduled_at(t0() - chrono::Duration::seconds(5)),
                t0(),
            )
            .unwrap();

        assert_eq!(now_job.status, JobStatus::Ready);
        assert_eq!(later.status, JobStatus::Scheduled);
        assert_eq!(past.status, JobStatus::Ready);
        state.check_invariants().unwrap();
    }

    #[test]
    fn invalid_enqueue_persists_nothing() {
        let mut state = QueueState::default();
        let err = state.enqueue(NewJob::new("", "default"), t0()).unwrap_err();

        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(state.counts().total(), 0);
    }

    #[test]
    fn scheduled_job_is_promoted_once_due() {
        let mut state = QueueState::default();
        let job = state
            .enqueue(
                NewJob::new("Report", "default").scheduled_at(t0() + chrono::Duration::seconds(60)),
                t0(),
            )
            .unwrap();

        assert!(state.promote_scheduled(t0() + chrono::Duration::seconds(59)).is_empty());
        assert_eq!(
            state.promote_scheduled(t0() + chrono::Duration::seconds(60)),
            vec![job.id]
        );
        assert_eq!(state.job(job.id).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn selection_orders_by_priority_then_id() {
        let mut state = QueueState::default();
        let low = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();
        let high = state
            .enqueue(NewJob::new("B", "default").with_priority(5), t0())
            .unwrap();
        let low_later = state.enqueue(NewJob::new("C", "default"), t0()).unwrap();

        let ids: Vec<JobId> = state
            .select_next_ready(&QueueSelector::all(), 10, t0())
            .iter()
            .map(|j| j.id)
            .collect();

        assert_eq!(ids, vec![high.id, low.id, low_later.id]);
    }

    #[test]
    fn selection_filters_queues() {
        let mut state = QueueState::default();
        state.enqueue(NewJob::new("A", "reports"), t0()).unwrap();
        let mail = state.enqueue(NewJob::new("B", "mailers"), t0()).unwrap();

        let selector: QueueSelector = "mail*".parse().unwrap();
        let picked = state.select_next_ready(&selector, 10, t0());

        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, mail.id);
    }

    #[test]
    fn release_unblocks_waiting_job() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        let a = state
            .enqueue(NewJob::new("Sync", "default").with_concurrency_key("K"), t0())
            .unwrap();
        let b = state
            .enqueue(NewJob::new("Sync", "default").with_concurrency_key("K"), t0())
            .unwrap();

        let batch = state.claim(pid, &QueueSelector::all(), 10, t0()).unwrap();
        assert_eq!(batch.claimed.len(), 1);
        assert_eq!(batch.claimed[0].id, a.id);
        assert_eq!(batch.blocked, vec![b.id]);
        assert_eq!(state.semaphore("K").unwrap().value, 0);

        run(&mut state, a.id, t0());

        assert_eq!(state.semaphore("K").unwrap().value, 1);
        assert_eq!(state.job(b.id).unwrap().status, JobStatus::Ready);
        state.check_invariants().unwrap();
    }

    #[test]
    fn saturated_key_with_waiters_is_skipped() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        for _ in 0..2 {
            state
                .enqueue(NewJob::new("Sync", "default").with_concurrency_key("K"), t0())
                .unwrap();
        }
        state.claim(pid, &QueueSelector::all(), 10, t0()).unwrap();

        let c = state
            .enqueue(NewJob::new("Sync", "default").with_concurrency_key("K"), t0())
            .unwrap();
        let free = state.enqueue(NewJob::new("Other", "default"), t0()).unwrap();

        let picked: Vec<JobId> = state
            .select_next_ready(&QueueSelector::all(), 10, t0())
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(picked, vec![free.id]);
        assert_eq!(state.job(c.id).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn failure_retries_then_fails_permanently() {
        let mut state = state_with(RetryPolicy::fixed(2, secs(10)));
        let pid = worker(&mut state);
        let job = state.enqueue(NewJob::new("Flaky", "default"), t0()).unwrap();

        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();
        state.mark_performed(job.id, t0()).unwrap();
        let first = state.mark_failed(job.id, "boom", t0()).unwrap();
        assert_eq!(
            first,
            Completion::Retrying {
                run_at: t0() + chrono::Duration::seconds(10)
            }
        );
        let retried = state.job(job.id).unwrap();
        assert_eq!(retried.status, JobStatus::Scheduled);
        assert_eq!(retried.attempts, 1);
        assert!(retried.failed_at.is_none());

        let later = t0() + chrono::Duration::seconds(10);
        state.promote_scheduled(later);
        state.heartbeat(pid, later).unwrap();
        state.claim(pid, &QueueSelector::all(), 1, later).unwrap();
        state.mark_performed(job.id, later).unwrap();
        assert_eq!(
            state.mark_failed(job.id, "boom again", later).unwrap(),
            Completion::Failed
        );

        let failed = state.job(job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.error_message.as_deref(), Some("boom again"));
        assert!(state.select_next_ready(&QueueSelector::all(), 10, later).is_empty());
        state.check_invariants().unwrap();
    }

    #[test]
    fn zero_delay_retry_goes_straight_to_ready() {
        let mut state = state_with(RetryPolicy::fixed(3, Duration::ZERO));
        let pid = worker(&mut state);
        let job = state.enqueue(NewJob::new("Flaky", "default"), t0()).unwrap();

        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();
        state.mark_performed(job.id, t0()).unwrap();
        state.mark_failed(job.id, "boom", t0()).unwrap();

        assert_eq!(state.job(job.id).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn completion_out_of_order_is_rejected() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        let job = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();

        assert!(matches!(
            state.mark_performed(job.id, t0()),
            Err(QueueError::InvalidState(_))
        ));

        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();
        assert!(matches!(
            state.mark_finished(job.id, t0()),
            Err(QueueError::InvalidState(_))
        ));

        state.mark_performed(job.id, t0()).unwrap();
        assert!(matches!(
            state.mark_performed(job.id, t0()),
            Err(QueueError::InvalidState(_))
        ));
        assert!(matches!(
            state.mark_finished(JobId::new(999), t0()),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn finishing_twice_is_a_no_op() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        let job = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();
        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();
        run(&mut state, job.id, t0());

        let before = state.job(job.id).unwrap();
        assert_eq!(state.mark_finished(job.id, t0()).unwrap(), Completion::Ignored);
        assert_eq!(state.job(job.id).unwrap(), before);
    }

    #[test]
    fn reaping_reclaims_claimed_jobs() {
        let mut state = state_with(RetryPolicy::fixed(1, Duration::ZERO));
        let pid = worker(&mut state);
        let keep = state
            .enqueue(NewJob::new("A", "default").with_max_attempts(3), t0())
            .unwrap();
        let exhaust = state
            .enqueue(NewJob::new("B", "default").with_concurrency_key("K"), t0())
            .unwrap();
        state.claim(pid, &QueueSelector::all(), 10, t0()).unwrap();

        let later = t0() + chrono::Duration::seconds(120);
        let report = state.reap(secs(60), later);

        assert_eq!(report.processes, vec![pid]);
        assert_eq!(report.requeued, vec![keep.id]);
        assert_eq!(report.failed, vec![exhaust.id]);
        assert_eq!(state.counts().claimed, 0);
        assert_eq!(state.semaphore("K").unwrap().value, 1);
        assert!(
            state
                .job(exhaust.id)
                .unwrap()
                .error_message
                .unwrap()
                .contains("stopped heartbeating")
        );
        assert!(matches!(
            state.heartbeat(pid, later),
            Err(QueueError::NotFound(_))
        ));
        state.check_invariants().unwrap();
    }

    #[test]
    fn late_completion_after_reap_is_ignored() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        let job = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();
        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();
        state.mark_performed(job.id, t0()).unwrap();

        let later = t0() + chrono::Duration::seconds(120);
        state.reap(secs(60), later);

        assert_eq!(state.mark_finished(job.id, later).unwrap(), Completion::Ignored);
        assert_eq!(state.job(job.id).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn deregister_returns_unstarted_jobs_with_attempt_refunded() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        let job = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();
        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();

        assert_eq!(state.deregister(pid, t0()).unwrap(), vec![job.id]);

        let returned = state.job(job.id).unwrap();
        assert_eq!(returned.status, JobStatus::Ready);
        assert_eq!(returned.attempts, 0);
        assert!(state.processes().is_empty());
    }

    #[test]
    fn register_requires_existing_supervisor() {
        let mut state = QueueState::default();
        let err = state
            .register(
                NewProcess::new(ProcessKind::Worker, "w").with_supervisor(ProcessId::new(42)),
                t0(),
            )
            .unwrap_err();
        assert_eq!(err, QueueError::process_not_found(ProcessId::new(42)));
    }

    #[test]
    fn cancel_only_pending_jobs() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        let claimed = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();
        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();
        let pending = state.enqueue(NewJob::new("B", "default"), t0()).unwrap();

        assert!(matches!(
            state.cancel(claimed.id),
            Err(QueueError::InvalidState(_))
        ));
        state.cancel(pending.id).unwrap();
        assert!(matches!(state.job(pending.id), Err(QueueError::NotFound(_))));
        state.check_invariants().unwrap();
    }

    #[test]
    fn paused_queue_holds_jobs_until_resumed() {
        let mut state = QueueState::default();
        let before = state.enqueue(NewJob::new("A", "mailers"), t0()).unwrap();
        assert_eq!(state.pause("mailers", t0()).unwrap(), 1);
        let during = state.enqueue(NewJob::new("B", "mailers"), t0()).unwrap();

        assert_eq!(state.job(before.id).unwrap().status, JobStatus::Paused);
        assert_eq!(state.job(during.id).unwrap().status, JobStatus::Paused);
        assert!(state.select_next_ready(&QueueSelector::all(), 10, t0()).is_empty());

        assert_eq!(state.resume("mailers", t0()), 2);
        assert_eq!(state.counts().ready, 2);
        assert!(state.paused_queues().is_empty());
    }

    #[test]
    fn failed_jobs_can_be_retried_or_discarded() {
        let mut state = state_with(RetryPolicy::no_retry());
        let pid = worker(&mut state);
        let a = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();
        let b = state.enqueue(NewJob::new("B", "default"), t0()).unwrap();
        state.claim(pid, &QueueSelector::all(), 2, t0()).unwrap();
        for id in [a.id, b.id] {
            state.mark_performed(id, t0()).unwrap();
            state.mark_failed(id, "nope", t0()).unwrap();
        }
        assert_eq!(state.list_failed(10).len(), 2);

        let retried = state.retry_failed(a.id, t0()).unwrap();
        assert_eq!(retried.status, JobStatus::Ready);
        assert_eq!(retried.attempts, 0);
        assert!(retried.error_message.is_none());

        state.discard_failed(b.id).unwrap();
        assert!(state.list_failed(10).is_empty());
        assert!(matches!(
            state.discard_failed(a.id),
            Err(QueueError::InvalidState(_))
        ));
        state.check_invariants().unwrap();
    }

    #[test]
    fn purge_removes_only_old_finished_jobs() {
        let mut state = QueueState::default();
        let pid = worker(&mut state);
        let old = state.enqueue(NewJob::new("A", "default"), t0()).unwrap();
        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();
        run(&mut state, old.id, t0());
        state.enqueue(NewJob::new("B", "default"), t0()).unwrap();

        assert_eq!(state.purge_finished(t0()), 0);
        assert_eq!(state.purge_finished(t0() + chrono::Duration::seconds(1)), 1);
        assert_eq!(state.counts().total(), 1);
    }

    #[test]
    fn expired_blocks_return_to_ready() {
        let config = QueueConfig::default()
            .with_concurrency(ConcurrencyLimits::default().with_ttl(secs(30)));
        let mut state = QueueState::new(config);
        let pid = worker(&mut state);
        for _ in 0..2 {
            state
                .enqueue(NewJob::new("Sync", "default").with_concurrency_key("K"), t0())
                .unwrap();
        }
        let batch = state.claim(pid, &QueueSelector::all(), 10, t0()).unwrap();
        let waiting = batch.blocked[0];

        assert!(state.release_expired_blocks(t0() + chrono::Duration::seconds(29)).is_empty());
        assert_eq!(
            state.release_expired_blocks(t0() + chrono::Duration::seconds(30)),
            vec![waiting]
        );
        assert_eq!(state.job(waiting).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn expired_semaphores_survive_while_held() {
        let config = QueueConfig::default()
            .with_concurrency(ConcurrencyLimits::default().with_ttl(secs(30)));
        let mut state = QueueState::new(config);
        let pid = worker(&mut state);
        let job = state
            .enqueue(NewJob::new("Sync", "default").with_concurrency_key("K"), t0())
            .unwrap();
        state.claim(pid, &QueueSelector::all(), 1, t0()).unwrap();

        let later = t0() + chrono::Duration::seconds(60);
        assert!(state.expire_semaphores(later).keys.is_empty());

        state.heartbeat(pid, later).unwrap();
        run(&mut state, job.id, later);
        assert_eq!(state.expire_semaphores(later).keys, vec!["K".to_string()]);
        assert!(state.semaphore("K").is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue { priority: i32, key: Option<u8>, delay: u8 },
        Claim { limit: usize },
        Finish { pick: usize },
        Fail { pick: usize },
        Cancel { pick: usize },
        Advance { secs: u16 },
        Maintain,
        Reap,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (-3i32..3, proptest::option::of(0u8..3), 0u8..3)
                .prop_map(|(priority, key, delay)| Op::Enqueue { priority, key, delay }),
            (1usize..4).prop_map(|limit| Op::Claim { limit }),
            any::<usize>().prop_map(|pick| Op::Finish { pick }),
            any::<usize>().prop_map(|pick| Op::Fail { pick }),
            any::<usize>().prop_map(|pick| Op::Cancel { pick }),
            (1u16..400).prop_map(|secs| Op::Advance { secs }),
            Just(Op::Maintain),
            Just(Op::Reap),
        ]
    }

    fn claimed_ids(state: &QueueState) -> Vec<JobId> {
        state.claimed.keys().copied().collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn random_operations_preserve_invariants(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let config = QueueConfig::default()
                .with_retry(RetryPolicy::fixed(2, secs(5)))
                .with_concurrency(
                    ConcurrencyLimits::default()
                        .with_limit("k1", 2)
                        .with_ttl(secs(60)),
                );
            let mut state = QueueState::new(config);
            let mut now = t0();
            let mut pid = worker(&mut state);

            for op in ops {
                match op {
                    Op::Enqueue { priority, key, delay } => {
                        let mut new = NewJob::new("Job", "default").with_priority(priority);
                        if let Some(k) = key {
                            new = new.with_concurrency_key(format!("k{k}"));
                        }
                        if delay > 0 {
                            new = new.scheduled_at(now + chrono::Duration::seconds(i64::from(delay) * 10));
                        }
                        state.enqueue(new, now).unwrap();
                    }
                    Op::Claim { limit } => {
                        if state.heartbeat(pid, now).is_err() {
                            pid = state
                                .register(NewProcess::new(ProcessKind::Worker, "worker"), now)
                                .unwrap()
                                .id;
                        }
                        state.claim(pid, &QueueSelector::all(), limit, now).unwrap();
                    }
                    Op::Finish { pick } | Op::Fail { pick } => {
                        let claimed = claimed_ids(&state);
                        if claimed.is_empty() {
                            continue;
                        }
                        let id = claimed[pick % claimed.len()];
                        state.mark_performed(id, now).unwrap();
                        if matches!(op, Op::Finish { .. }) {
                            state.mark_finished(id, now).unwrap();
                        } else {
                            state.mark_failed(id, "boom", now).unwrap();
                        }
                    }
                    Op::Cancel { pick } => {
                        let ids: Vec<JobId> = state.jobs.keys().copied().collect();
                        if ids.is_empty() {
                            continue;
                        }
                        let id = ids[pick % ids.len()];
                        let pending = state.job(id).unwrap().status.is_pending();
                        prop_assert_eq!(state.cancel(id).is_ok(), pending);
                    }
                    Op::Advance { secs: s } => {
                        now += chrono::Duration::seconds(i64::from(s));
                    }
                    Op::Maintain => {
                        state.promote_scheduled(now);
                        state.release_expired_blocks(now);
                        state.expire_semaphores(now);
                    }
                    Op::Reap => {
                        state.reap(secs(120), now);
                    }
                }
                prop_assert_eq!(state.check_invariants(), Ok(()));
            }
        }

        #[test]
        fn selection_is_sorted(priorities in proptest::collection::vec(-5i32..5, 1..40)) {
            let mut state = QueueState::default();
            for p in priorities {
                state.enqueue(NewJob::new("Job", "default").with_priority(p), t0()).unwrap();
            }

            let picked = state.select_next_ready(&QueueSelector::all(), usize::MAX, t0());
            for pair in picked.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(
                    a.priority > b.priority || (a.priority == b.priority && a.id < b.id)
                );
            }
        }
    }
}
