//! Execution budget and backoff curve for failed jobs.
//!
//! `attempts` on a job counts executions, including the first one, so a
//! budget of `max_attempts = 3` means one run plus two retries. Whether a
//! job may run again is decided by [`Job::has_retries_left`](crate::Job::has_retries_left)
//! against the job's own budget; this policy only supplies the default
//! budget and how long to wait before the next run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shape of the delay curve between executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// `base * 2^(executions - 1)`
    #[default]
    Exponential,
    /// `base * executions`
    Linear,
}

impl BackoffStrategy {
    /// Uncapped delay after `executions` runs (at least one).
    fn curve(self, base: Duration, executions: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(executions),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(executions - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

impl core::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Default execution budget for jobs enqueued without their own.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay (0.0 to 1.0) the jitter may add or remove.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single execution; the first failure is final.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Same delay before every retry, without jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// How long a job that has run `executions` times waits before the next run.
    ///
    /// Zero executions means the job never ran, so there is nothing to back off from.
    pub fn delay_for_attempt(&self, executions: u32) -> Duration {
        if executions == 0 {
            return Duration::ZERO;
        }
        let delay = self
            .strategy
            .curve(self.base_delay, executions)
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + jitter * spread(executions);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }
}

/// Deterministic value in `[-1, 1)` derived from the execution count.
fn spread(executions: u32) -> f64 {
    let mixed = executions.wrapping_mul(0x9E37_79B9) >> 16;
    f64::from(mixed) / 32_768.0 - 1.0
}
