//! Runtime configuration for workers, the dispatcher and the binary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use durq_core::config::{env_millis_or, env_or, env_secs_or};
use durq_core::{QueueConfig, QueueError, QueueResult, QueueSelector};

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name recorded on the worker's process row and in logs.
    pub name: String,
    pub queues: QueueSelector,
    /// Upper bound on jobs claimed per poll.
    pub batch_size: usize,
    /// Jobs executed at the same time.
    pub max_concurrent: usize,
    /// Sleep between polls that found nothing.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            queues: QueueSelector::all(),
            batch_size: 5,
            max_concurrent: 3,
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queues(mut self, queues: QueueSelector) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// A worker must heartbeat more often than the reaper's threshold.
    pub fn validate(&self, stale_after: Duration) -> QueueResult<()> {
        check_heartbeat(&self.name, self.heartbeat_interval, stale_after)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            name: lookup("DURQ_WORKER_NAME").unwrap_or(defaults.name),
            queues: env_or(&lookup, "DURQ_WORKER_QUEUES", defaults.queues),
            batch_size: env_or(&lookup, "DURQ_WORKER_BATCH_SIZE", defaults.batch_size).max(1),
            max_concurrent: env_or(&lookup, "DURQ_WORKER_THREADS", defaults.max_concurrent).max(1),
            poll_interval: env_millis_or(&lookup, "DURQ_WORKER_POLL_MS", defaults.poll_interval),
            heartbeat_interval: env_secs_or(
                &lookup,
                "DURQ_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            ),
        }
    }
}

/// Maintenance loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub name: String,
    /// Time between maintenance ticks.
    pub polling_interval: Duration,
    /// A process silent for longer than this is reaped.
    pub stale_after: Duration,
    pub heartbeat_interval: Duration,
    /// Finished jobs older than this are purged; `None` keeps them forever.
    pub finished_retention: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            polling_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(60),
            finished_retention: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = Some(retention);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.polling_interval.is_zero() {
            return Err(QueueError::validation(format!(
                "{}: polling interval must be positive",
                self.name
            )));
        }
        check_heartbeat(&self.name, self.heartbeat_interval, self.stale_after)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let finished_retention = lookup("DURQ_FINISHED_RETENTION_SECS")
            .map(|_| env_secs_or(&lookup, "DURQ_FINISHED_RETENTION_SECS", Duration::ZERO))
            .filter(|retention| !retention.is_zero());
        Self {
            name: lookup("DURQ_DISPATCHER_NAME").unwrap_or(defaults.name),
            polling_interval: env_millis_or(
                &lookup,
                "DURQ_DISPATCH_INTERVAL_MS",
                defaults.polling_interval,
            ),
            stale_after: env_secs_or(
                &lookup,
                "DURQ_PROCESS_ALIVE_THRESHOLD_SECS",
                defaults.stale_after,
            ),
            heartbeat_interval: env_secs_or(
                &lookup,
                "DURQ_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            ),
            finished_retention,
        }
    }
}

/// A heartbeat at or past the staleness threshold gets a healthy process reaped.
fn check_heartbeat(name: &str, heartbeat: Duration, stale_after: Duration) -> QueueResult<()> {
    if heartbeat.is_zero() || heartbeat >= stale_after {
        return Err(QueueError::validation(format!(
            "{name}: heartbeat interval {heartbeat:?} must be positive and below the staleness threshold {stale_after:?}"
        )));
    }
    Ok(())
}

/// Everything the `durq-dispatcher` binary needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// sqlx SQLite URL, e.g. `sqlite://durq.db`.
    pub database_url: String,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
}

impl RuntimeConfig {
    pub const DEFAULT_DATABASE_URL: &'static str = "sqlite://durq.db";

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DURQ_DATABASE_URL")
                .unwrap_or_else(|| Self::DEFAULT_DATABASE_URL.to_string()),
            queue: QueueConfig::from_lookup(&lookup),
            dispatcher: DispatcherConfig::from_lookup(&lookup),
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        self.dispatcher.validate()
    }
}
