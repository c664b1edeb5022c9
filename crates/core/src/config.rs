//! Engine configuration.
//!
//! Values come from code (builder setters) or from `DURQ_*` environment
//! variables. Unparseable variables are logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::semaphore::ConcurrencyLimits;

/// Semantics shared by every store backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    pub concurrency: ConcurrencyLimits,
}

impl QueueConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyLimits) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_or(&lookup, "DURQ_MAX_ATTEMPTS", defaults.retry.max_attempts),
            base_delay: env_millis_or(&lookup, "DURQ_BACKOFF_BASE_MS", defaults.retry.base_delay),
            max_delay: env_millis_or(&lookup, "DURQ_BACKOFF_MAX_MS", defaults.retry.max_delay),
            strategy: env_or::<BackoffStrategy>(
                &lookup,
                "DURQ_BACKOFF_STRATEGY",
                defaults.retry.strategy,
            ),
            jitter: env_or(&lookup, "DURQ_BACKOFF_JITTER", defaults.retry.jitter),
        };

        let per_key = match lookup("DURQ_CONCURRENCY_LIMITS") {
            Some(raw) => ConcurrencyLimits::parse_overrides(&raw).unwrap_or_else(|error| {
                warn!(var = "DURQ_CONCURRENCY_LIMITS", %error, "ignoring invalid value");
                defaults.concurrency.per_key.clone()
            }),
            None => defaults.concurrency.per_key.clone(),
        };
        let concurrency = ConcurrencyLimits {
            default_limit: env_or(
                &lookup,
                "DURQ_CONCURRENCY_DEFAULT",
                defaults.concurrency.default_limit,
            ),
            per_key,
            ttl: env_secs_or(&lookup, "DURQ_CONCURRENCY_TTL_SECS", defaults.concurrency.ttl),
        };

        Self { retry, concurrency }
    }
}

/// Parse `key` from `lookup`, keeping `default` when missing or invalid.
pub fn env_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(error) => {
                warn!(var = key, value = %raw, %error, "ignoring invalid value");
                default
            }
        },
        None => default,
    }
}

pub fn env_millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    Duration::from_millis(env_or(lookup, key, default.as_millis() as u64))
}

pub fn env_secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    Duration::from_secs(env_or(lookup, key, default.as_secs()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = QueueConfig::from_lookup(|_| None);

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert_eq!(config.concurrency.default_limit, 1);
    }

    #[test]
    fn reads_overrides_from_variables() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("DURQ_MAX_ATTEMPTS", "3"),
            ("DURQ_BACKOFF_STRATEGY", "linear"),
            ("DURQ_BACKOFF_BASE_MS", "250"),
            ("DURQ_CONCURRENCY_LIMITS", "reports=4"),
            ("DURQ_CONCURRENCY_TTL_SECS", "30"),
        ]));

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.concurrency.capacity_for("reports"), 4);
        assert_eq!(config.concurrency.ttl, Duration::from_secs(30));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("DURQ_MAX_ATTEMPTS", "many"),
            ("DURQ_CONCURRENCY_LIMITS", "reports"),
        ]));

        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.concurrency.per_key.is_empty());
    }
}
