//! Row decoding and error mapping for the SQLite backend.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SQLite result code | QueueError |
//! |------------|--------------------|------------|
//! | Database | `SQLITE_BUSY` (5), `SQLITE_LOCKED` (6) and extended variants | `TransientStore` |
//! | Database | constraint violations (19 and extended) | `Storage` |
//! | Database | any other | `Storage` |
//! | PoolTimedOut | N/A | `TransientStore` |
//! | PoolClosed, RowNotFound, Other | N/A | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use durq_core::{Job, JobId, JobStatus, Process, ProcessId, ProcessKind, QueueError, Semaphore};

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => QueueError::transient(msg),
                _ => QueueError::storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            QueueError::transient(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            QueueError::storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            QueueError::storage(format!("unexpected row not found in {}", operation))
        }
        _ => QueueError::storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Drop sub-millisecond precision so values compare equal after a round trip.
pub(crate) fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

pub(crate) fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(millis)
}

fn from_millis(column: &str, ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::storage(format!("{column} out of range: {ms}")))
}

fn from_opt_millis(column: &str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, QueueError> {
    ms.map(|ms| from_millis(column, ms)).transpose()
}

pub(crate) fn parse_status(raw: &str) -> Result<JobStatus, QueueError> {
    JobStatus::ALL
        .into_iter()
        .find(|status| status.as_str() == raw)
        .ok_or_else(|| QueueError::storage(format!("unknown job status '{raw}'")))
}

/// Columns selected for a job, qualified with the `j` alias.
pub(crate) const JOB_COLUMNS: &str = "j.id, j.class_name, j.arguments, j.queue_name, j.priority, \
     j.concurrency_key, j.correlation_id, j.status, j.scheduled_at, j.performed_at, \
     j.finished_at, j.failed_at, j.error_message, j.attempts, j.max_attempts, \
     j.created_at, j.updated_at";

// SQLx row types

#[derive(Debug)]
pub(crate) struct JobRow {
    id: i64,
    class_name: String,
    arguments: String,
    queue_name: String,
    priority: i64,
    concurrency_key: Option<String>,
    correlation_id: Option<String>,
    status: String,
    scheduled_at: Option<i64>,
    performed_at: Option<i64>,
    finished_at: Option<i64>,
    failed_at: Option<i64>,
    error_message: Option<String>,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            class_name: row.try_get("class_name")?,
            arguments: row.try_get("arguments")?,
            queue_name: row.try_get("queue_name")?,
            priority: row.try_get("priority")?,
            concurrency_key: row.try_get("concurrency_key")?,
            correlation_id: row.try_get("correlation_id")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            performed_at: row.try_get("performed_at")?,
            finished_at: row.try_get("finished_at")?,
            failed_at: row.try_get("failed_at")?,
            error_message: row.try_get("error_message")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let arguments = serde_json::from_str(&row.arguments).map_err(|e| {
            QueueError::storage(format!("job {} has malformed arguments: {e}", row.id))
        })?;

        Ok(Job {
            id: JobId::new(row.id),
            class_name: row.class_name,
            arguments,
            queue_name: row.queue_name,
            priority: narrow("priority", row.priority)?,
            concurrency_key: row.concurrency_key,
            correlation_id: row.correlation_id,
            status: parse_status(&row.status)?,
            scheduled_at: from_opt_millis("scheduled_at", row.scheduled_at)?,
            performed_at: from_opt_millis("performed_at", row.performed_at)?,
            finished_at: from_opt_millis("finished_at", row.finished_at)?,
            failed_at: from_opt_millis("failed_at", row.failed_at)?,
            error_message: row.error_message,
            attempts: narrow("attempts", row.attempts)?,
            max_attempts: narrow("max_attempts", row.max_attempts)?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
        })
    }
}

#[derive(Debug)]
pub(crate) struct ProcessRow {
    id: i64,
    kind: String,
    name: String,
    pid: i64,
    hostname: String,
    supervisor_id: Option<i64>,
    metadata: String,
    last_heartbeat_at: i64,
    created_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ProcessRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(ProcessRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            name: row.try_get("name")?,
            pid: row.try_get("pid")?,
            hostname: row.try_get("hostname")?,
            supervisor_id: row.try_get("supervisor_id")?,
            metadata: row.try_get("metadata")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<ProcessRow> for Process {
    type Error = QueueError;

    fn try_from(row: ProcessRow) -> Result<Self, Self::Error> {
        Ok(Process {
            id: ProcessId::new(row.id),
            kind: row.kind.parse::<ProcessKind>().map_err(QueueError::storage)?,
            name: row.name,
            pid: narrow("pid", row.pid)?,
            hostname: row.hostname,
            supervisor_id: row.supervisor_id.map(ProcessId::new),
            metadata: serde_json::from_str(&row.metadata).map_err(|e| {
                QueueError::storage(format!("process {} has malformed metadata: {e}", row.id))
            })?,
            last_heartbeat_at: from_millis("last_heartbeat_at", row.last_heartbeat_at)?,
            created_at: from_millis("created_at", row.created_at)?,
        })
    }
}

pub(crate) fn semaphore_from_row(row: &SqliteRow) -> Result<Semaphore, QueueError> {
    let value: i64 = row
        .try_get("value")
        .map_err(|e| map_sqlx_error("semaphore", e))?;
    let expires_at: i64 = row
        .try_get("expires_at")
        .map_err(|e| map_sqlx_error("semaphore", e))?;
    Ok(Semaphore {
        key: row
            .try_get("key")
            .map_err(|e| map_sqlx_error("semaphore", e))?,
        value: narrow("value", value)?,
        expires_at: from_millis("expires_at", expires_at)?,
    })
}

fn narrow<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, QueueError> {
    T::try_from(value).map_err(|_| QueueError::storage(format!("{column} out of range: {value}")))
}
