//! SQLite-backed queue store.
//!
//! Every [`QueueStore`] operation runs in one transaction. Index moves are
//! compare-and-swap updates on `durq_jobs.status` (`WHERE id = ? AND status = ?`)
//! followed by a delete from the old index table and an insert into the new
//! one, so a job is never visible in two indexes and two writers racing on
//! the same job cannot both win. Semaphores are decremented with a
//! conditional `UPDATE ... WHERE value > 0` or created with
//! `INSERT ... ON CONFLICT DO NOTHING`.
//!
//! ## Thread Safety
//!
//! `SqliteQueueStore` is `Send + Sync`. Write transactions issued through one
//! store instance are serialized by an async gate; other processes sharing the
//! database file are arbitrated by SQLite's own locking. Write transactions
//! open with `BEGIN IMMEDIATE` and wait out the busy timeout before failing
//! with [`QueueError::TransientStore`].

mod rows;
mod schema;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use durq_core::clock;
use durq_core::{
    ClaimBatch, Clock, Completion, ConcurrencyLimits, ExecutionError, IndexCounts, Job, JobId,
    JobStatus, NewJob, NewProcess, Process, ProcessId, QueueConfig, QueueError, QueueResult,
    QueueSelector, ReapReport, Semaphore, SemaphoreExpiry, SystemClock,
};

use crate::store::QueueStore;
use rows::{
    JOB_COLUMNS, JobRow, ProcessRow, map_sqlx_error, millis, opt_millis, parse_status,
    truncate_millis,
};

/// Durable [`QueueStore`] on SQLite.
#[derive(Debug)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    write_gate: Mutex<()>,
}

impl SqliteQueueStore {
    /// Wrap an existing pool. Call [`SqliteQueueStore::migrate`] before use.
    pub fn new(pool: SqlitePool, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            config,
            clock,
            write_gate: Mutex::new(()),
        }
    }

    /// Open (creating if needed) a database file and apply the schema.
    ///
    /// `url` is a sqlx SQLite URL such as `sqlite://durq.db`.
    pub async fn connect(url: &str, config: QueueConfig) -> QueueResult<Self> {
        Self::connect_with_clock(url, config, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        url: &str,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool, config, clock);
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, kept alive by a single pooled connection.
    pub async fn in_memory(config: QueueConfig, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool, config, clock);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the queue tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> QueueResult<()> {
        let (_gate, mut tx) = self.begin("migrate").await?;
        for statement in schema::STATEMENTS {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        commit(tx, "migrate").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Verify that every job is in exactly the index its status names and
    /// that semaphore values are consistent with current holders.
    pub async fn check_invariants(&self) -> QueueResult<()> {
        let mut conn = self.acquire("check_invariants").await?;

        let rows = sqlx::query(
            r#"
            SELECT
                j.id,
                j.status,
                (SELECT COUNT(*) FROM durq_ready_executions x WHERE x.job_id = j.id) AS ready,
                (SELECT COUNT(*) FROM durq_scheduled_executions x WHERE x.job_id = j.id) AS scheduled,
                (SELECT COUNT(*) FROM durq_claimed_executions x WHERE x.job_id = j.id) AS claimed,
                (SELECT COUNT(*) FROM durq_blocked_executions x WHERE x.job_id = j.id) AS blocked,
                (SELECT COUNT(*) FROM durq_failed_executions x WHERE x.job_id = j.id) AS failed,
                (SELECT COUNT(*) FROM durq_paused_executions x WHERE x.job_id = j.id) AS paused
            FROM durq_jobs j
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("check_invariants", e))?;

        for row in rows {
            let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("check_invariants", e))?;
            let raw: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("check_invariants", e))?;
            let status = parse_status(&raw)?;

            for candidate in JobStatus::ALL {
                let Some(table) = index_table(candidate) else {
                    continue;
                };
                let column = table
                    .trim_start_matches("durq_")
                    .trim_end_matches("_executions");
                let count: i64 = row
                    .try_get(column)
                    .map_err(|e| map_sqlx_error("check_invariants", e))?;
                let expected = i64::from(candidate == status);
                if count != expected {
                    return Err(QueueError::storage(format!(
                        "job {id} has status {status} but {count} rows in {table}"
                    )));
                }
            }
        }

        let orphaned: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM durq_claimed_executions c
            LEFT JOIN durq_processes p ON p.id = c.process_id
            WHERE p.id IS NULL
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("check_invariants", e))?;
        if orphaned > 0 {
            return Err(QueueError::storage(format!(
                "{orphaned} claimed executions reference missing processes"
            )));
        }

        let holders = sqlx::query(
            r#"
            SELECT
                j.concurrency_key AS key,
                COUNT(*) AS holders,
                s.value AS value
            FROM durq_claimed_executions c
            JOIN durq_jobs j ON j.id = c.job_id
            LEFT JOIN durq_semaphores s ON s.key = j.concurrency_key
            WHERE j.concurrency_key IS NOT NULL
            GROUP BY j.concurrency_key
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("check_invariants", e))?;

        for row in holders {
            let key: String = row.try_get("key").map_err(|e| map_sqlx_error("check_invariants", e))?;
            let held: i64 = row
                .try_get("holders")
                .map_err(|e| map_sqlx_error("check_invariants", e))?;
            let value: Option<i64> = row
                .try_get("value")
                .map_err(|e| map_sqlx_error("check_invariants", e))?;
            let capacity = i64::from(self.config.concurrency.capacity_for(&key));
            match value {
                Some(value) if value + held <= capacity => {}
                Some(value) => {
                    return Err(QueueError::storage(format!(
                        "key {key}: {held} holders with {value} free slots exceeds capacity {capacity}"
                    )));
                }
                None => {
                    return Err(QueueError::storage(format!(
                        "key {key} has holders but no semaphore"
                    )));
                }
            }
        }

        let semaphores = sqlx::query("SELECT key, value, expires_at FROM durq_semaphores")
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("check_invariants", e))?;
        for row in semaphores {
            let semaphore = rows::semaphore_from_row(&row)?;
            if semaphore.value > self.config.concurrency.capacity_for(&semaphore.key) {
                return Err(QueueError::storage(format!(
                    "semaphore {} above capacity",
                    semaphore.key
                )));
            }
        }
        Ok(())
    }

    /// Current time truncated to the stored precision.
    fn now(&self) -> DateTime<Utc> {
        truncate_millis(self.clock.now())
    }

    fn limits(&self) -> &ConcurrencyLimits {
        &self.config.concurrency
    }

    async fn begin(
        &self,
        operation: &str,
    ) -> QueueResult<(MutexGuard<'_, ()>, Transaction<'static, Sqlite>)> {
        let gate = self.write_gate.lock().await;
        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok((gate, tx))
    }

    async fn acquire(&self, operation: &str) -> QueueResult<sqlx::pool::PoolConnection<Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    #[instrument(skip(self, job), fields(class = %job.class_name, queue = %job.queue_name), err)]
    async fn enqueue(&self, job: NewJob) -> QueueResult<Job> {
        job.validate()?;
        let now = self.now();
        let (_gate, mut tx) = self.begin("enqueue").await?;

        let mut record = Job::from_new(JobId::new(0), job, self.config.retry.max_attempts, now);
        record.scheduled_at = record.scheduled_at.map(truncate_millis);
        let paused = queue_is_paused(&mut tx, &record.queue_name).await?;
        let placement = match record.scheduled_at.filter(|at| *at > now) {
            Some(at) => Placement::Scheduled(at),
            None if paused => Placement::Paused,
            None => Placement::Ready,
        };
        record.status = placement.status();

        let arguments = serde_json::to_string(&record.arguments)
            .map_err(|e| QueueError::validation(format!("arguments are not serializable: {e}")))?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO durq_jobs (
                class_name, arguments, queue_name, priority, concurrency_key, correlation_id,
                status, scheduled_at, attempts, max_attempts, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&record.class_name)
        .bind(arguments)
        .bind(&record.queue_name)
        .bind(record.priority)
        .bind(record.concurrency_key.as_deref())
        .bind(record.correlation_id.as_deref())
        .bind(record.status.as_str())
        .bind(opt_millis(record.scheduled_at))
        .bind(i64::from(record.max_attempts))
        .bind(millis(now))
        .bind(millis(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        record.id = JobId::new(inserted.last_insert_rowid());
        insert_index(&mut tx, &record, placement, now).await?;
        commit(tx, "enqueue").await?;

        debug!(job_id = %record.id, status = %record.status, "enqueued job");
        Ok(record)
    }

    async fn job(&self, id: JobId) -> QueueResult<Job> {
        let mut conn = self.acquire("job").await?;
        require_job(&mut conn, id).await
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        let (_gate, mut tx) = self.begin("cancel").await?;
        let job = require_job(&mut tx, id).await?;
        if !job.status.is_pending() {
            return Err(QueueError::invalid_state(format!(
                "job {id} is {} and cannot be cancelled",
                job.status
            )));
        }
        delete_job(&mut tx, &job).await?;
        commit(tx, "cancel").await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn mark_performed(&self, id: JobId) -> QueueResult<Job> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("mark_performed").await?;
        let mut job = require_job(&mut tx, id).await?;
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

        let updated = sqlx::query(
            r#"
            UPDATE durq_jobs SET performed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'claimed' AND performed_at IS NULL
            "#,
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(id.get())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_performed", e))?;
        if updated.rows_affected() != 1 {
            return Err(conflict(id));
        }
        commit(tx, "mark_performed").await?;

        job.performed_at = Some(now);
        job.updated_at = now;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn mark_finished(&self, id: JobId) -> QueueResult<Completion> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("mark_finished").await?;
        let mut job = require_job(&mut tx, id).await?;
        if !job.accepts_completion()? {
            debug!(job_id = %id, status = %job.status, "ignoring completion for unclaimed job");
            return Ok(Completion::Ignored);
        }

        let key = job.concurrency_key.clone();
        job.finished_at = Some(now);
        if !transition(&mut tx, &mut job, Placement::Finished, now).await? {
            return Ok(Completion::Ignored);
        }
        if let Some(key) = key {
            release_slot(&mut tx, self.limits(), &key, now).await?;
        }
        commit(tx, "mark_finished").await?;
        Ok(Completion::Finished)
    }

    #[instrument(skip(self, error), err)]
    async fn mark_failed(&self, id: JobId, error: &ExecutionError) -> QueueResult<Completion> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("mark_failed").await?;
        let mut job = require_job(&mut tx, id).await?;
        if !job.accepts_completion()? {
            debug!(job_id = %id, status = %job.status, "ignoring failure for unclaimed job");
            return Ok(Completion::Ignored);
        }

        let key = job.concurrency_key.clone();
        job.error_message = Some(error.message.clone());
        let (moved, completion) = if job.has_retries_left() {
            let delay = self.config.retry.delay_for_attempt(job.attempts);
            job.performed_at = None;
            if delay.is_zero() {
                let moved = make_available(&mut tx, &mut job, now).await?;
                (moved, Completion::Retrying { run_at: now })
            } else {
                let run_at = clock::after(now, delay);
                let moved = transition(&mut tx, &mut job, Placement::Scheduled(run_at), now).await?;
                (moved, Completion::Retrying { run_at })
            }
        } else {
            job.failed_at = Some(now);
            let moved = transition(&mut tx, &mut job, Placement::Failed, now).await?;
            (moved, Completion::Failed)
        };
        if !moved {
            return Ok(Completion::Ignored);
        }

        if let Some(key) = key {
            release_slot(&mut tx, self.limits(), &key, now).await?;
        }
        commit(tx, "mark_failed").await?;
        Ok(completion)
    }

    #[instrument(skip(self), err)]
    async fn promote_scheduled(&self) -> QueueResult<Vec<JobId>> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("promote_scheduled").await?;
        let due: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT job_id FROM durq_scheduled_executions
            WHERE scheduled_at <= ?
            ORDER BY scheduled_at ASC, job_id ASC
            "#,
        )
        .bind(millis(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("promote_scheduled", e))?;

        let mut promoted = Vec::with_capacity(due.len());
        for id in due.into_iter().map(JobId::new) {
            let mut job = require_job(&mut tx, id).await?;
            if make_available(&mut tx, &mut job, now).await? {
                promoted.push(id);
            }
        }
        commit(tx, "promote_scheduled").await?;
        Ok(promoted)
    }

    async fn select_next_ready(
        &self,
        selector: &QueueSelector,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let now = self.now();
        let mut conn = self.acquire("select_next_ready").await?;
        select_ready(&mut conn, selector, limit, now).await
    }

    #[instrument(skip(self, selector), fields(queues = ?selector.patterns()), err)]
    async fn claim(
        &self,
        process_id: ProcessId,
        selector: &QueueSelector,
        limit: usize,
    ) -> QueueResult<ClaimBatch> {
        let now = self.now();
        let ttl = self.limits().ttl;
        let (_gate, mut tx) = self.begin("claim").await?;
        if !process_exists(&mut tx, process_id).await? {
            return Err(QueueError::process_not_found(process_id));
        }

        let mut batch = ClaimBatch::default();
        for mut job in select_ready(&mut tx, selector, limit, now).await? {
            let key = job.concurrency_key.clone();
            let acquired = match key.as_deref() {
                Some(key) => try_acquire(&mut tx, self.limits(), key, ttl, now).await?,
                None => true,
            };

            if acquired {
                job.attempts += 1;
                if transition(&mut tx, &mut job, Placement::Claimed(process_id), now).await? {
                    batch.claimed.push(job);
                } else if let Some(key) = key.as_deref() {
                    signal(&mut tx, self.limits(), key, now).await?;
                }
            } else {
                let expires_at = clock::after(now, ttl);
                if transition(&mut tx, &mut job, Placement::Blocked { expires_at }, now).await? {
                    debug!(job_id = %job.id, "job blocked on concurrency key");
                    batch.blocked.push(job.id);
                }
            }
        }
        commit(tx, "claim").await?;
        Ok(batch)
    }

    #[instrument(skip(self), err)]
    async fn try_acquire(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("try_acquire").await?;
        let acquired = try_acquire(&mut tx, self.limits(), key, ttl, now).await?;
        commit(tx, "try_acquire").await?;
        Ok(acquired)
    }

    #[instrument(skip(self), err)]
    async fn release(&self, key: &str) -> QueueResult<Option<JobId>> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("release").await?;
        let unblocked = release_slot(&mut tx, self.limits(), key, now).await?;
        commit(tx, "release").await?;
        Ok(unblocked)
    }

    async fn semaphore(&self, key: &str) -> QueueResult<Option<Semaphore>> {
        let mut conn = self.acquire("semaphore").await?;
        let row = sqlx::query("SELECT key, value, expires_at FROM durq_semaphores WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("semaphore", e))?;
        row.as_ref().map(rows::semaphore_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn release_expired_blocks(&self) -> QueueResult<Vec<JobId>> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("release_expired_blocks").await?;
        let expired: Vec<i64> = sqlx::query_scalar(
            "SELECT job_id FROM durq_blocked_executions WHERE expires_at <= ? ORDER BY job_id ASC",
        )
        .bind(millis(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release_expired_blocks", e))?;

        let mut released = Vec::with_capacity(expired.len());
        for id in expired.into_iter().map(JobId::new) {
            let mut job = require_job(&mut tx, id).await?;
            if make_available(&mut tx, &mut job, now).await? {
                released.push(id);
            }
        }
        commit(tx, "release_expired_blocks").await?;
        Ok(released)
    }

    #[instrument(skip(self), err)]
    async fn expire_semaphores(&self) -> QueueResult<SemaphoreExpiry> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("expire_semaphores").await?;
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT s.key FROM durq_semaphores s
            WHERE s.expires_at <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM durq_claimed_executions c
                  JOIN durq_jobs j ON j.id = c.job_id
                  WHERE j.concurrency_key = s.key
              )
            ORDER BY s.key ASC
            "#,
        )
        .bind(millis(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("expire_semaphores", e))?;

        let mut unblocked = Vec::new();
        for key in &keys {
            sqlx::query("DELETE FROM durq_semaphores WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("expire_semaphores", e))?;
            for _ in 0..self.limits().capacity_for(key) {
                match unblock_next(&mut tx, key, now).await? {
                    Some(id) => unblocked.push(id),
                    None => break,
                }
            }
        }
        commit(tx, "expire_semaphores").await?;
        Ok(SemaphoreExpiry { keys, unblocked })
    }

    #[instrument(skip(self, process), fields(kind = %process.kind, name = %process.name), err)]
    async fn register(&self, process: NewProcess) -> QueueResult<Process> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("register").await?;
        if let Some(supervisor_id) = process.supervisor_id {
            if !process_exists(&mut tx, supervisor_id).await? {
                return Err(QueueError::process_not_found(supervisor_id));
            }
        }

        let metadata = serde_json::to_string(&process.metadata)
            .map_err(|e| QueueError::validation(format!("metadata is not serializable: {e}")))?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO durq_processes (
                kind, name, pid, hostname, supervisor_id, metadata, last_heartbeat_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(process.kind.as_str())
        .bind(&process.name)
        .bind(i64::from(process.pid))
        .bind(&process.hostname)
        .bind(process.supervisor_id.map(ProcessId::get))
        .bind(metadata)
        .bind(millis(now))
        .bind(millis(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("register", e))?;
        commit(tx, "register").await?;

        Ok(Process::from_new(
            ProcessId::new(inserted.last_insert_rowid()),
            process,
            now,
        ))
    }

    async fn heartbeat(&self, id: ProcessId) -> QueueResult<()> {
        let now = self.now();
        let updated = sqlx::query("UPDATE durq_processes SET last_heartbeat_at = ? WHERE id = ?")
            .bind(millis(now))
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("heartbeat", e))?;
        if updated.rows_affected() == 0 {
            return Err(QueueError::process_not_found(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn deregister(&self, id: ProcessId) -> QueueResult<Vec<JobId>> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("deregister").await?;
        if !process_exists(&mut tx, id).await? {
            return Err(QueueError::process_not_found(id));
        }

        let returned = claimed_by(&mut tx, id).await?;
        for job_id in &returned {
            let mut job = require_job(&mut tx, *job_id).await?;
            if job.performed_at.is_none() {
                job.attempts = job.attempts.saturating_sub(1);
            }
            job.performed_at = None;
            let key = job.concurrency_key.clone();
            if !make_available(&mut tx, &mut job, now).await? {
                return Err(conflict(*job_id));
            }
            if let Some(key) = key {
                release_slot(&mut tx, self.limits(), &key, now).await?;
            }
        }
        delete_process(&mut tx, id).await?;
        commit(tx, "deregister").await?;
        Ok(returned)
    }

    #[instrument(skip(self), err)]
    async fn reap(&self, stale_after: Duration) -> QueueResult<ReapReport> {
        let now = self.now();
        let cutoff = clock::before(now, stale_after);
        let (_gate, mut tx) = self.begin("reap").await?;
        let stale: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM durq_processes WHERE last_heartbeat_at < ? ORDER BY id ASC",
        )
        .bind(millis(cutoff))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reap", e))?;

        let mut report = ReapReport::default();
        for process_id in stale.into_iter().map(ProcessId::new) {
            for job_id in claimed_by(&mut tx, process_id).await? {
                let mut job = require_job(&mut tx, job_id).await?;
                let key = job.concurrency_key.clone();
                job.performed_at = None;
                let moved = if job.has_retries_left() {
                    let moved = make_available(&mut tx, &mut job, now).await?;
                    report.requeued.push(job_id);
                    moved
                } else {
                    job.failed_at = Some(now);
                    job.error_message = Some(format!("process {process_id} stopped heartbeating"));
                    let moved = transition(&mut tx, &mut job, Placement::Failed, now).await?;
                    report.failed.push(job_id);
                    moved
                };
                if !moved {
                    return Err(conflict(job_id));
                }
                if let Some(key) = key {
                    release_slot(&mut tx, self.limits(), &key, now).await?;
                }
            }
            delete_process(&mut tx, process_id).await?;
            warn!(process_id = %process_id, "reaped stale process");
            report.processes.push(process_id);
        }
        commit(tx, "reap").await?;
        Ok(report)
    }

    async fn processes(&self) -> QueueResult<Vec<Process>> {
        let mut conn = self.acquire("processes").await?;
        let rows = sqlx::query_as::<_, ProcessRow>(
            r#"
            SELECT id, kind, name, pid, hostname, supervisor_id, metadata, last_heartbeat_at, created_at
            FROM durq_processes
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("processes", e))?;
        rows.into_iter().map(Process::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn pause(&self, queue_name: &str) -> QueueResult<usize> {
        if queue_name.trim().is_empty() {
            return Err(QueueError::validation("queue_name must not be empty"));
        }
        let now = self.now();
        let (_gate, mut tx) = self.begin("pause").await?;
        sqlx::query(
            "INSERT INTO durq_pauses (queue_name, created_at) VALUES (?, ?) ON CONFLICT (queue_name) DO NOTHING",
        )
        .bind(queue_name)
        .bind(millis(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("pause", e))?;

        let ready: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT job_id FROM durq_ready_executions
            WHERE queue_name = ?
            ORDER BY priority DESC, job_id ASC
            "#,
        )
        .bind(queue_name)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("pause", e))?;

        let mut held = 0;
        for id in ready.into_iter().map(JobId::new) {
            let mut job = require_job(&mut tx, id).await?;
            if transition(&mut tx, &mut job, Placement::Paused, now).await? {
                held += 1;
            }
        }
        commit(tx, "pause").await?;
        Ok(held)
    }

    #[instrument(skip(self), err)]
    async fn resume(&self, queue_name: &str) -> QueueResult<usize> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("resume").await?;
        sqlx::query("DELETE FROM durq_pauses WHERE queue_name = ?")
            .bind(queue_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("resume", e))?;

        let paused: Vec<i64> = sqlx::query_scalar(
            "SELECT job_id FROM durq_paused_executions WHERE queue_name = ? ORDER BY job_id ASC",
        )
        .bind(queue_name)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("resume", e))?;

        let mut released = 0;
        for id in paused.into_iter().map(JobId::new) {
            let mut job = require_job(&mut tx, id).await?;
            if transition(&mut tx, &mut job, Placement::Ready, now).await? {
                released += 1;
            }
        }
        commit(tx, "resume").await?;
        Ok(released)
    }

    async fn paused_queues(&self) -> QueueResult<Vec<String>> {
        sqlx::query_scalar("SELECT queue_name FROM durq_pauses ORDER BY queue_name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("paused_queues", e))
    }

    async fn list_failed(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM durq_failed_executions f
            JOIN durq_jobs j ON j.id = f.job_id
            ORDER BY f.job_id ASC
            LIMIT ?
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_failed", e))?;
        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn retry_failed(&self, id: JobId) -> QueueResult<Job> {
        let now = self.now();
        let (_gate, mut tx) = self.begin("retry_failed").await?;
        let mut job = require_failed(&mut tx, id).await?;
        job.attempts = 0;
        job.failed_at = None;
        job.error_message = None;
        job.performed_at = None;
        if !make_available(&mut tx, &mut job, now).await? {
            return Err(conflict(id));
        }
        commit(tx, "retry_failed").await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn discard_failed(&self, id: JobId) -> QueueResult<Job> {
        let (_gate, mut tx) = self.begin("discard_failed").await?;
        let job = require_failed(&mut tx, id).await?;
        delete_job(&mut tx, &job).await?;
        commit(tx, "discard_failed").await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn purge_finished(&self, before: DateTime<Utc>) -> QueueResult<usize> {
        let (_gate, mut tx) = self.begin("purge_finished").await?;
        let deleted = sqlx::query(
            "DELETE FROM durq_jobs WHERE status = 'finished' AND finished_at < ?",
        )
        .bind(millis(before))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("purge_finished", e))?;
        commit(tx, "purge_finished").await?;
        Ok(deleted.rows_affected() as usize)
    }

    async fn counts(&self) -> QueueResult<IndexCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM durq_ready_executions) AS ready,
                (SELECT COUNT(*) FROM durq_scheduled_executions) AS scheduled,
                (SELECT COUNT(*) FROM durq_claimed_executions) AS claimed,
                (SELECT COUNT(*) FROM durq_blocked_executions) AS blocked,
                (SELECT COUNT(*) FROM durq_failed_executions) AS failed,
                (SELECT COUNT(*) FROM durq_paused_executions) AS paused,
                (SELECT COUNT(*) FROM durq_jobs WHERE status = 'finished') AS finished
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("counts", e))?;

        let count = |column: &str| -> QueueResult<usize> {
            let n: i64 = row.try_get(column).map_err(|e| map_sqlx_error("counts", e))?;
            Ok(n as usize)
        };
        Ok(IndexCounts {
            ready: count("ready")?,
            scheduled: count("scheduled")?,
            claimed: count("claimed")?,
            blocked: count("blocked")?,
            failed: count("failed")?,
            paused: count("paused")?,
            finished: count("finished")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

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

impl Placement {
    fn status(&self) -> JobStatus {
        match self {
            Placement::Ready => JobStatus::Ready,
            Placement::Scheduled(_) => JobStatus::Scheduled,
            Placement::Claimed(_) => JobStatus::Claimed,
            Placement::Blocked { .. } => JobStatus::Blocked,
            Placement::Failed => JobStatus::Failed,
            Placement::Paused => JobStatus::Paused,
            Placement::Finished => JobStatus::Finished,
        }
    }
}

fn index_table(status: JobStatus) -> Option<&'static str> {
    match status {
        JobStatus::Ready => Some("durq_ready_executions"),
        JobStatus::Scheduled => Some("durq_scheduled_executions"),
        JobStatus::Claimed => Some("durq_claimed_executions"),
        JobStatus::Blocked => Some("durq_blocked_executions"),
        JobStatus::Failed => Some("durq_failed_executions"),
        JobStatus::Paused => Some("durq_paused_executions"),
        JobStatus::Finished => None,
    }
}

fn conflict(id: JobId) -> QueueError {
    QueueError::transient(format!("job {id} was changed by a concurrent writer"))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

async fn commit(tx: Transaction<'static, Sqlite>, operation: &str) -> QueueResult<()> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error(operation, e))
}

async fn fetch_job(conn: &mut SqliteConnection, id: JobId) -> QueueResult<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM durq_jobs j WHERE j.id = ?");
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("fetch_job", e))?;
    row.map(Job::try_from).transpose()
}

async fn require_job(conn: &mut SqliteConnection, id: JobId) -> QueueResult<Job> {
    fetch_job(conn, id)
        .await?
        .ok_or(QueueError::job_not_found(id))
}

async fn require_failed(conn: &mut SqliteConnection, id: JobId) -> QueueResult<Job> {
    let job = require_job(conn, id).await?;
    if job.status != JobStatus::Failed {
        return Err(QueueError::invalid_state(format!(
            "job {id} is {}, not failed",
            job.status
        )));
    }
    Ok(job)
}

/// Delete a job and its index row, provided nobody moved it since it was read.
async fn delete_job(conn: &mut SqliteConnection, job: &Job) -> QueueResult<()> {
    let deleted = sqlx::query("DELETE FROM durq_jobs WHERE id = ? AND status = ?")
        .bind(job.id.get())
        .bind(job.status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_job", e))?;
    if deleted.rows_affected() != 1 {
        return Err(conflict(job.id));
    }
    if let Some(table) = index_table(job.status) {
        sqlx::query(&format!("DELETE FROM {table} WHERE job_id = ?"))
            .bind(job.id.get())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
    }
    Ok(())
}

async fn queue_is_paused(conn: &mut SqliteConnection, queue_name: &str) -> QueueResult<bool> {
    let paused: i64 =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM durq_pauses WHERE queue_name = ?)")
            .bind(queue_name)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("queue_is_paused", e))?;
    Ok(paused != 0)
}

async fn process_exists(conn: &mut SqliteConnection, id: ProcessId) -> QueueResult<bool> {
    let exists: i64 =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM durq_processes WHERE id = ?)")
            .bind(id.get())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("process_exists", e))?;
    Ok(exists != 0)
}

async fn claimed_by(conn: &mut SqliteConnection, process_id: ProcessId) -> QueueResult<Vec<JobId>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT job_id FROM durq_claimed_executions WHERE process_id = ? ORDER BY job_id ASC",
    )
    .bind(process_id.get())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("claimed_by", e))?;
    Ok(ids.into_iter().map(JobId::new).collect())
}

async fn delete_process(conn: &mut SqliteConnection, id: ProcessId) -> QueueResult<()> {
    sqlx::query("DELETE FROM durq_processes WHERE id = ?")
        .bind(id.get())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_process", e))?;
    Ok(())
}

/// Ready jobs in dispatch order, skipping keys that are saturated and
/// already have unexpired waiters.
async fn select_ready(
    conn: &mut SqliteConnection,
    selector: &QueueSelector,
    limit: usize,
    now: DateTime<Utc>,
) -> QueueResult<Vec<Job>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {JOB_COLUMNS} FROM durq_ready_executions r JOIN durq_jobs j ON j.id = r.job_id WHERE 1 = 1"
    ));

    if !selector.patterns().iter().any(|p| p == "*") {
        qb.push(" AND (");
        let mut any = qb.separated(" OR ");
        for pattern in selector.patterns() {
            match pattern.strip_suffix('*') {
                Some(prefix) => {
                    any.push("substr(r.queue_name, 1, ");
                    any.push_bind_unseparated(prefix.chars().count() as i64);
                    any.push_unseparated(") = ");
                    any.push_bind_unseparated(prefix.to_string());
                }
                None => {
                    any.push("r.queue_name = ");
                    any.push_bind_unseparated(pattern.clone());
                }
            }
        }
        qb.push(")");
    }

    qb.push(
        r#"
        AND NOT (
            j.concurrency_key IS NOT NULL
            AND EXISTS (
                SELECT 1 FROM durq_semaphores s
                WHERE s.key = j.concurrency_key AND s.value = 0
            )
            AND EXISTS (
                SELECT 1 FROM durq_blocked_executions b
                WHERE b.concurrency_key = j.concurrency_key AND b.expires_at > "#,
    );
    qb.push_bind(millis(now));
    qb.push("))");
    qb.push(" ORDER BY r.priority DESC, r.job_id ASC LIMIT ");
    qb.push_bind(sql_limit(limit));

    let rows = qb
        .build_query_as::<JobRow>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("select_ready", e))?;
    rows.into_iter().map(Job::try_from).collect()
}

/// Move `job` to `to`, persisting its mutable fields.
///
/// Returns `false` when another writer moved the job first; nothing is
/// written in that case.
async fn transition(
    conn: &mut SqliteConnection,
    job: &mut Job,
    to: Placement,
    now: DateTime<Utc>,
) -> QueueResult<bool> {
    let from = job.status;
    if let Placement::Scheduled(at) = to {
        job.scheduled_at = Some(at);
    }

    let updated = sqlx::query(
        r#"
        UPDATE durq_jobs SET
            status = ?,
            scheduled_at = ?,
            performed_at = ?,
            finished_at = ?,
            failed_at = ?,
            error_message = ?,
            attempts = ?,
            updated_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to.status().as_str())
    .bind(opt_millis(job.scheduled_at))
    .bind(opt_millis(job.performed_at))
    .bind(opt_millis(job.finished_at))
    .bind(opt_millis(job.failed_at))
    .bind(job.error_message.as_deref())
    .bind(i64::from(job.attempts))
    .bind(millis(now))
    .bind(job.id.get())
    .bind(from.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("transition", e))?;
    if updated.rows_affected() != 1 {
        debug!(job_id = %job.id, from = %from, to = %to.status(), "lost transition race");
        return Ok(false);
    }

    if let Some(table) = index_table(from) {
        sqlx::query(&format!("DELETE FROM {table} WHERE job_id = ?"))
            .bind(job.id.get())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;
    }

    job.status = to.status();
    job.updated_at = now;
    insert_index(conn, job, to, now).await?;
    Ok(true)
}

/// Ready, unless the job's queue is paused.
async fn make_available(
    conn: &mut SqliteConnection,
    job: &mut Job,
    now: DateTime<Utc>,
) -> QueueResult<bool> {
    let placement = if queue_is_paused(conn, &job.queue_name).await? {
        Placement::Paused
    } else {
        Placement::Ready
    };
    transition(conn, job, placement, now).await
}

async fn insert_index(
    conn: &mut SqliteConnection,
    job: &Job,
    placement: Placement,
    now: DateTime<Utc>,
) -> QueueResult<()> {
    let id = job.id.get();
    let result = match placement {
        Placement::Ready => {
            sqlx::query(
                "INSERT INTO durq_ready_executions (job_id, queue_name, priority, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&job.queue_name)
            .bind(job.priority)
            .bind(millis(now))
            .execute(&mut *conn)
            .await
        }
        Placement::Scheduled(at) => {
            sqlx::query(
                "INSERT INTO durq_scheduled_executions (job_id, queue_name, priority, scheduled_at, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&job.queue_name)
            .bind(job.priority)
            .bind(millis(at))
            .bind(millis(now))
            .execute(&mut *conn)
            .await
        }
        Placement::Claimed(process_id) => {
            sqlx::query(
                "INSERT INTO durq_claimed_executions (job_id, process_id, queue_name, priority, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(process_id.get())
            .bind(&job.queue_name)
            .bind(job.priority)
            .bind(millis(now))
            .execute(&mut *conn)
            .await
        }
        Placement::Blocked { expires_at } => {
            sqlx::query(
                "INSERT INTO durq_blocked_executions (job_id, queue_name, priority, concurrency_key, expires_at, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&job.queue_name)
            .bind(job.priority)
            .bind(job.concurrency_key.as_deref())
            .bind(millis(expires_at))
            .bind(millis(now))
            .execute(&mut *conn)
            .await
        }
        Placement::Failed => {
            sqlx::query(
                "INSERT INTO durq_failed_executions (job_id, queue_name, priority, error, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&job.queue_name)
            .bind(job.priority)
            .bind(job.error_message.as_deref())
            .bind(millis(now))
            .execute(&mut *conn)
            .await
        }
        Placement::Paused => {
            sqlx::query(
                "INSERT INTO durq_paused_executions (job_id, queue_name, priority, paused_at) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&job.queue_name)
            .bind(job.priority)
            .bind(millis(now))
            .execute(&mut *conn)
            .await
        }
        Placement::Finished => return Ok(()),
    };
    result
        .map(|_| ())
        .map_err(|e| map_sqlx_error("insert_index", e))
}

/// Take a slot: decrement an existing row with free capacity, or create the
/// row with one slot already in use.
async fn try_acquire(
    conn: &mut SqliteConnection,
    limits: &ConcurrencyLimits,
    key: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> QueueResult<bool> {
    let expires_at = millis(clock::after(now, ttl));

    let decremented = sqlx::query(
        r#"
        UPDATE durq_semaphores SET value = value - 1, expires_at = ?, updated_at = ?
        WHERE key = ? AND value > 0
        "#,
    )
    .bind(expires_at)
    .bind(millis(now))
    .bind(key)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("try_acquire", e))?;
    if decremented.rows_affected() == 1 {
        return Ok(true);
    }

    let created = sqlx::query(
        r#"
        INSERT INTO durq_semaphores (key, value, expires_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (key) DO NOTHING
        "#,
    )
    .bind(key)
    .bind(i64::from(limits.capacity_for(key) - 1))
    .bind(expires_at)
    .bind(millis(now))
    .bind(millis(now))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("try_acquire", e))?;
    Ok(created.rows_affected() == 1)
}

/// Return one slot, capped at capacity.
async fn signal(
    conn: &mut SqliteConnection,
    limits: &ConcurrencyLimits,
    key: &str,
    now: DateTime<Utc>,
) -> QueueResult<()> {
    sqlx::query("UPDATE durq_semaphores SET value = MIN(value + 1, ?), updated_at = ? WHERE key = ?")
        .bind(i64::from(limits.capacity_for(key)))
        .bind(millis(now))
        .bind(key)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("signal", e))?;
    Ok(())
}

async fn release_slot(
    conn: &mut SqliteConnection,
    limits: &ConcurrencyLimits,
    key: &str,
    now: DateTime<Utc>,
) -> QueueResult<Option<JobId>> {
    signal(conn, limits, key, now).await?;
    unblock_next(conn, key, now).await
}

async fn unblock_next(
    conn: &mut SqliteConnection,
    key: &str,
    now: DateTime<Utc>,
) -> QueueResult<Option<JobId>> {
    let next: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT job_id FROM durq_blocked_executions
        WHERE concurrency_key = ?
        ORDER BY priority DESC, job_id ASC
        LIMIT 1
        "#,
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("unblock_next", e))?;

    let Some(id) = next.map(JobId::new) else {
        return Ok(None);
    };
    let mut job = require_job(conn, id).await?;
    if !make_available(conn, &mut job, now).await? {
        return Err(conflict(id));
    }
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use durq_core::{ManualClock, ProcessKind, RetryPolicy};

    use super::*;

    async fn store() -> (SqliteQueueStore, ManualClock) {
        let clock = ManualClock::new(
            DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap(),
        );
        let store = SqliteQueueStore::in_memory(
            QueueConfig::default().with_retry(RetryPolicy::fixed(2, Duration::from_secs(5))),
            Arc::new(clock.clone()),
        )
        .await
        .unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let (store, _) = store().await;
        store.migrate().await.unwrap();
        store.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_round_trips_job_fields() {
        let (store, clock) = store().await;
        let job = store
            .enqueue(
                NewJob::new("Mailer", "mailers")
                    .with_arguments(serde_json::json!({"to": "a@example.com"}))
                    .with_priority(3)
                    .with_concurrency_key("user:1")
                    .with_correlation_id("ext-1"),
            )
            .await
            .unwrap();

        let loaded = store.job(job.id).await.unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded.created_at, clock.now());
        assert_eq!(loaded.status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn queue_prefix_filter_is_case_sensitive() {
        let (store, _) = store().await;
        store.enqueue(NewJob::new("A", "Mailers")).await.unwrap();
        let lower = store.enqueue(NewJob::new("B", "mailers")).await.unwrap();

        let selector: QueueSelector = "mail*".parse().unwrap();
        let picked = store.select_next_ready(&selector, 10).await.unwrap();

        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, lower.id);
    }

    #[tokio::test]
    async fn failure_records_error_in_failed_table() {
        let (store, _) = store().await;
        let worker = store
            .register(NewProcess::new(ProcessKind::Worker, "w"))
            .await
            .unwrap();
        let job = store
            .enqueue(NewJob::new("A", "default").with_max_attempts(1))
            .await
            .unwrap();
        store
            .claim(worker.id, &QueueSelector::all(), 1)
            .await
            .unwrap();
        store.mark_performed(job.id).await.unwrap();
        let outcome = store
            .mark_failed(job.id, &ExecutionError::new("kaput"))
            .await
            .unwrap();
        assert_eq!(outcome, Completion::Failed);

        let error: Option<String> =
            sqlx::query_scalar("SELECT error FROM durq_failed_executions WHERE job_id = ?")
                .bind(job.id.get())
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(error.as_deref(), Some("kaput"));
        store.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn deleting_supervisor_detaches_children() {
        let (store, _) = store().await;
        let supervisor = store
            .register(NewProcess::new(ProcessKind::Supervisor, "s"))
            .await
            .unwrap();
        let worker = store
            .register(NewProcess::new(ProcessKind::Worker, "w").with_supervisor(supervisor.id))
            .await
            .unwrap();

        store.deregister(supervisor.id).await.unwrap();

        let remaining = store.processes().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, worker.id);
        assert_eq!(remaining[0].supervisor_id, None);
    }

    #[tokio::test]
    async fn claimed_and_failed_rows_keep_queue_and_priority() {
        let (store, _) = store().await;
        let worker = store
            .register(NewProcess::new(ProcessKind::Worker, "w"))
            .await
            .unwrap();
        let job = store
            .enqueue(NewJob::new("A", "reports").with_priority(4).with_max_attempts(1))
            .await
            .unwrap();
        store
            .claim(worker.id, &QueueSelector::all(), 1)
            .await
            .unwrap();

        let (queue, priority): (String, i64) = sqlx::query_as(
            "SELECT queue_name, priority FROM durq_claimed_executions WHERE job_id = ?",
        )
        .bind(job.id.get())
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!((queue.as_str(), priority), ("reports", 4));

        store.mark_performed(job.id).await.unwrap();
        store
            .mark_failed(job.id, &ExecutionError::new("boom"))
            .await
            .unwrap();

        let (queue, priority): (String, i64) = sqlx::query_as(
            "SELECT queue_name, priority FROM durq_failed_executions WHERE job_id = ?",
        )
        .bind(job.id.get())
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!((queue.as_str(), priority), ("reports", 4));
    }

    #[tokio::test]
    async fn enqueue_returns_stored_schedule_precision() {
        let (store, clock) = store().await;
        let at = clock.now() + chrono::Duration::seconds(60) + chrono::Duration::microseconds(700);

        let job = store
            .enqueue(NewJob::new("A", "default").scheduled_at(at))
            .await
            .unwrap();

        assert_eq!(job.scheduled_at, Some(at - chrono::Duration::microseconds(700)));
        assert_eq!(store.job(job.id).await.unwrap(), job);
    }

    fn temp_database(name: &str) -> (String, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "durq-{name}-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        (format!("sqlite://{}", path.display()), path)
    }

    fn remove_database(path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[tokio::test]
    async fn write_transactions_take_the_write_lock_up_front() {
        use sqlx::{ConnectOptions, Executor};

        let (url, path) = temp_database("immediate");
        let store = SqliteQueueStore::connect(&url, QueueConfig::default())
            .await
            .unwrap();

        let (_gate, tx) = store.begin("test").await.unwrap();
        let mut other = SqliteConnectOptions::from_str(&url)
            .unwrap()
            .busy_timeout(Duration::ZERO)
            .connect()
            .await
            .unwrap();
        let contended = (&mut other).execute("BEGIN IMMEDIATE").await;
        assert!(contended.is_err(), "a second writer got the lock");

        tx.rollback().await.unwrap();
        drop(other);
        store.pool().close().await;
        remove_database(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stores_sharing_a_file_respect_key_capacity() {
        let (url, path) = temp_database("capacity");
        let config = QueueConfig::default()
            .with_concurrency(ConcurrencyLimits::default().with_limit("shared", 3));
        let first = Arc::new(SqliteQueueStore::connect(&url, config.clone()).await.unwrap());
        let second = Arc::new(SqliteQueueStore::connect(&url, config).await.unwrap());

        let mut tasks = Vec::new();
        for n in 0..6 {
            let store = if n % 2 == 0 { first.clone() } else { second.clone() };
            tasks.push(tokio::spawn(async move {
                let mut values = Vec::new();
                for _ in 0..25 {
                    if store.try_acquire("shared", Duration::from_secs(60)).await.unwrap() {
                        let value: i64 = sqlx::query_scalar(
                            "SELECT value FROM durq_semaphores WHERE key = 'shared'",
                        )
                        .fetch_one(store.pool())
                        .await
                        .unwrap();
                        values.push(value);
                        store.release("shared").await.unwrap();
                    }
                    tokio::task::yield_now().await;
                }
                values
            }));
        }

        let mut observed = Vec::new();
        for task in tasks {
            observed.extend(task.await.unwrap());
        }
        assert!(!observed.is_empty());
        assert!(observed.iter().all(|v| (0..=2).contains(v)), "{observed:?}");

        let value: i64 = sqlx::query_scalar("SELECT value FROM durq_semaphores WHERE key = 'shared'")
            .fetch_one(first.pool())
            .await
            .unwrap();
        assert_eq!(value, 3);
        first.check_invariants().await.unwrap();

        first.pool().close().await;
        second.pool().close().await;
        remove_database(&path);
    }
}
