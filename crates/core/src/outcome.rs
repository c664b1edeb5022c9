//! Results of multi-row store transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, ProcessId};
use crate::job::Job;

/// Jobs handed to a worker by one claim call, plus the candidates that lost
/// the race for their concurrency key and were parked as blocked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimBatch {
    pub claimed: Vec<Job>,
    pub blocked: Vec<JobId>,
}

impl ClaimBatch {
    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty() && self.blocked.is_empty()
    }
}

/// What a completion report did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Completion {
    Finished,
    /// Execution failed with budget left; the job runs again at `run_at`.
    Retrying { run_at: DateTime<Utc> },
    /// Execution failed and the retry budget is spent.
    Failed,
    /// The job was no longer claimed (already finished, reaped or cancelled).
    Ignored,
}

/// Processes removed by a reap pass and what happened to their claimed jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub processes: Vec<ProcessId>,
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

/// Semaphore rows deleted by expiry and the blocked jobs released for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemaphoreExpiry {
    pub keys: Vec<String>,
    pub unblocked: Vec<JobId>,
}
