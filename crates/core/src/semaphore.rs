//! Per-key concurrency limiting.
//!
//! A semaphore row holds the number of free slots for a concurrency key. A
//! missing row means every slot is free, so rows only exist while a key is
//! (or recently was) in use.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semaphore {
    pub key: String,
    /// Remaining free slots.
    pub value: u32,
    pub expires_at: DateTime<Utc>,
}

impl Semaphore {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Capacity per concurrency key and how long blocks and slots stay valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    pub default_limit: u32,
    pub per_key: BTreeMap<String, u32>,
    /// Lifetime of a blocked entry and of an acquired slot before maintenance may reclaim it.
    pub ttl: Duration,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            default_limit: 1,
            per_key: BTreeMap::new(),
            ttl: Duration::from_secs(180),
        }
    }
}

impl ConcurrencyLimits {
    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_limit(mut self, key: impl Into<String>, limit: u32) -> Self {
        self.per_key.insert(key.into(), limit);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Number of jobs sharing `key` that may be claimed at once (at least 1).
    pub fn capacity_for(&self, key: &str) -> u32 {
        self.per_key
            .get(key)
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }

    /// Parse `key=limit` pairs separated by commas.
    pub fn parse_overrides(raw: &str) -> Result<BTreeMap<String, u32>, String> {
        let mut overrides = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, limit) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected key=limit, got '{pair}'"))?;
            let limit = limit
                .trim()
                .parse::<u32>()
                .map_err(|e| format!("limit for '{}': {e}", key.trim()))?;
            overrides.insert(key.trim().to_string(), limit);
        }
        Ok(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_falls_back_to_default() {
        let limits = ConcurrencyLimits::default()
            .with_default_limit(2)
            .with_limit("reports", 5);

        assert_eq!(limits.capacity_for("reports"), 5);
        assert_eq!(limits.capacity_for("emails"), 2);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let limits = ConcurrencyLimits::default().with_limit("broken", 0);
        assert_eq!(limits.capacity_for("broken"), 1);
    }

    #[test]
    fn overrides_parse_from_pairs() {
        let parsed = ConcurrencyLimits::parse_overrides("a=2, b = 3,").unwrap();
        assert_eq!(parsed.get("a"), Some(&2));
        assert_eq!(parsed.get("b"), Some(&3));

        assert!(ConcurrencyLimits::parse_overrides("a").is_err());
        assert!(ConcurrencyLimits::parse_overrides("a=x").is_err());
    }
}
