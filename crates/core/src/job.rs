//! Job records and their lifecycle status.

use core::cmp::Reverse;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::id::JobId;

/// Where a job currently lives.
///
/// Every status except `Finished` corresponds to exactly one dispatch index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ready,
    Scheduled,
    Claimed,
    Blocked,
    Failed,
    Paused,
    Finished,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Ready,
        JobStatus::Scheduled,
        JobStatus::Claimed,
        JobStatus::Blocked,
        JobStatus::Failed,
        JobStatus::Paused,
        JobStatus::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "ready",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Claimed => "claimed",
            JobStatus::Blocked => "blocked",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Finished => "finished",
        }
    }

    /// Not yet handed to a worker; may still be cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            JobStatus::Ready | JobStatus::Scheduled | JobStatus::Blocked | JobStatus::Paused
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer-side description of a job to enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub class_name: String,
    pub arguments: serde_json::Value,
    pub queue_name: String,
    /// Higher runs first.
    pub priority: i32,
    /// `None` (or a past instant) means as soon as possible.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency_key: Option<String>,
    /// External correlation id (e.g. the producer's own job identifier).
    pub correlation_id: Option<String>,
    /// Overrides the configured retry budget for this job.
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(class_name: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            arguments: serde_json::Value::Null,
            queue_name: queue_name.into(),
            priority: 0,
            scheduled_at: None,
            concurrency_key: None,
            correlation_id: None,
            max_attempts: None,
        }
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Reject arguments that must never reach the store.
    pub fn validate(&self) -> QueueResult<()> {
        if self.class_name.trim().is_empty() {
            return Err(QueueError::validation("class_name must not be empty"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::validation("queue_name must not be empty"));
        }
        if self
            .concurrency_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(QueueError::validation(
                "concurrency_key must not be blank when present",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(QueueError::validation("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub class_name: String,
    pub arguments: serde_json::Value,
    pub queue_name: String,
    pub priority: i32,
    pub concurrency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub status: JobStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub performed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Number of times the job has been claimed for execution.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build the initial record for an accepted [`NewJob`].
    ///
    /// The status is provisional; the store decides the first index.
    pub fn from_new(id: JobId, new: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            class_name: new.class_name,
            arguments: new.arguments,
            queue_name: new.queue_name,
            priority: new.priority,
            concurrency_key: new.concurrency_key,
            correlation_id: new.correlation_id,
            status: JobStatus::Ready,
            scheduled_at: new.scheduled_at,
            performed_at: None,
            finished_at: None,
            failed_at: None,
            error_message: None,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
            created_at: now,
            updated_at: now,
        }
    }

    /// Dispatch rank; smaller ranks are claimed first.
    pub fn rank(&self) -> Rank {
        Rank::new(self.priority, self.id)
    }

    pub fn has_retries_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether a finished/failed report applies to this job.
    ///
    /// `Ok(false)` means the job is no longer claimed (already completed,
    /// reaped or cancelled) and the report should be ignored. A claimed job
    /// that never started executing is a lifecycle violation.
    pub fn accepts_completion(&self) -> QueueResult<bool> {
        if self.status != JobStatus::Claimed {
            return Ok(false);
        }
        if self.performed_at.is_none() {
            return Err(QueueError::invalid_state(format!(
                "job {} was never marked performed",
                self.id
            )));
        }
        Ok(true)
    }
}

/// Ordering key of the ready index: priority descending, then job id ascending.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank {
    priority: Reverse<i32>,
    job_id: JobId,
}

impl Rank {
    pub fn new(priority: i32, job_id: JobId) -> Self {
        Self {
            priority: Reverse(priority),
            job_id,
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority.0
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Row counts per dispatch index (plus retained finished jobs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCounts {
    pub ready: usize,
    pub scheduled: usize,
    pub claimed: usize,
    pub blocked: usize,
    pub failed: usize,
    pub paused: usize,
    pub finished: usize,
}

impl IndexCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Ready => self.ready,
            JobStatus::Scheduled => self.scheduled,
            JobStatus::Claimed => self.claimed,
            JobStatus::Blocked => self.blocked,
            JobStatus::Failed => self.failed,
            JobStatus::Paused => self.paused,
            JobStatus::Finished => self.finished,
        }
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
