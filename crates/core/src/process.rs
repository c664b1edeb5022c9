//! Registered worker, dispatcher and supervisor processes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::id::ProcessId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Supervisor,
    Worker,
    Dispatcher,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Supervisor => "supervisor",
            ProcessKind::Worker => "worker",
            ProcessKind::Dispatcher => "dispatcher",
        }
    }
}

impl core::str::FromStr for ProcessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervisor" => Ok(Self::Supervisor),
            "worker" => Ok(Self::Worker),
            "dispatcher" => Ok(Self::Dispatcher),
            other => Err(format!("unknown process kind '{other}'")),
        }
    }
}

impl core::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration request for a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProcess {
    pub kind: ProcessKind,
    pub name: String,
    pub pid: u32,
    pub hostname: String,
    pub supervisor_id: Option<ProcessId>,
    pub metadata: serde_json::Value,
}

impl NewProcess {
    pub fn new(kind: ProcessKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            pid: std::process::id(),
            hostname: local_hostname(),
            supervisor_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_supervisor(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A live (or not yet reaped) process row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub name: String,
    pub pid: u32,
    pub hostname: String,
    pub supervisor_id: Option<ProcessId>,
    pub metadata: serde_json::Value,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Process {
    pub fn from_new(id: ProcessId, new: NewProcess, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            name: new.name,
            pid: new.pid,
            hostname: new.hostname,
            supervisor_id: new.supervisor_id,
            metadata: new.metadata,
            last_heartbeat_at: now,
            created_at: now,
        }
    }

    /// No heartbeat within `stale_after` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.last_heartbeat_at < clock::before(now, stale_after)
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_is_strictly_older_than_threshold() {
        let now = Utc::now();
        let mut process = Process::from_new(
            ProcessId::new(1),
            NewProcess::new(ProcessKind::Worker, "worker-1"),
            now,
        );

        assert!(!process.is_stale(now, Duration::from_secs(30)));

        process.last_heartbeat_at = now - chrono::Duration::seconds(30);
        assert!(!process.is_stale(now, Duration::from_secs(30)));

        process.last_heartbeat_at = now - chrono::Duration::seconds(31);
        assert!(process.is_stale(now, Duration::from_secs(30)));
    }

    #[test]
    fn kind_round_trips_through_text() {
        for kind in [ProcessKind::Supervisor, ProcessKind::Worker, ProcessKind::Dispatcher] {
            assert_eq!(kind.as_str().parse::<ProcessKind>(), Ok(kind));
        }
    }
}
