//! Queue selection for workers.

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Set of queue patterns a worker polls.
///
/// A pattern is an exact queue name, `*` for every queue, or a prefix ending
/// in `*` (`mail*` matches `mailers` and `mail_digest`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueSelector {
    patterns: Vec<String>,
}

impl QueueSelector {
    pub fn new<I, S>(patterns: I) -> QueueResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.into().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        if patterns.is_empty() {
            return Err(QueueError::validation("queue selector needs at least one queue"));
        }
        Ok(Self { patterns })
    }

    pub fn all() -> Self {
        Self {
            patterns: vec!["*".to_string()],
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, queue_name: &str) -> bool {
        self.patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => queue_name.starts_with(prefix),
            None => pattern == queue_name,
        })
    }
}

impl Default for QueueSelector {
    fn default() -> Self {
        Self::all()
    }
}

impl core::str::FromStr for QueueSelector {
    type Err = QueueError;

    /// Comma-separated list of patterns.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split(','))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_prefix_and_wildcard() {
        let selector: QueueSelector = "default, mail*".parse().unwrap();

        assert!(selector.matches("default"));
        assert!(selector.matches("mailers"));
        assert!(selector.matches("mail"));
        assert!(!selector.matches("defaults"));
        assert!(!selector.matches("reports"));

        assert!(QueueSelector::all().matches("anything"));
    }

    #[test]
    fn empty_selector_is_rejected() {
        assert!(matches!(
            " , ".parse::<QueueSelector>(),
            Err(QueueError::Validation(_))
        ));
    }
}
