//! SQLite schema.
//!
//! One table per dispatch index, each with a unique `job_id`.
//! `durq_jobs.status` names the index that currently owns the job and is the
//! compare-and-swap pivot for every transition.
//! Timestamps are stored as integer milliseconds since the Unix epoch.

pub(crate) const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS durq_jobs (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        class_name      TEXT    NOT NULL CHECK (length(class_name) > 0),
        arguments       TEXT    NOT NULL,
        queue_name      TEXT    NOT NULL CHECK (length(queue_name) > 0),
        priority        INTEGER NOT NULL DEFAULT 0,
        concurrency_key TEXT,
        correlation_id  TEXT,
        status          TEXT    NOT NULL,
        scheduled_at    INTEGER,
        performed_at    INTEGER,
        finished_at     INTEGER,
        failed_at       INTEGER,
        error_message   TEXT,
        attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts    INTEGER NOT NULL CHECK (max_attempts >= 1),
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        CHECK (finished_at IS NULL OR failed_at IS NULL)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_jobs_status_finished ON durq_jobs (status, finished_at)",
    "CREATE INDEX IF NOT EXISTS durq_jobs_concurrency_key ON durq_jobs (concurrency_key)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_processes (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        kind              TEXT    NOT NULL,
        name              TEXT    NOT NULL,
        pid               INTEGER NOT NULL,
        hostname          TEXT    NOT NULL,
        supervisor_id     INTEGER REFERENCES durq_processes (id) ON DELETE SET NULL,
        metadata          TEXT    NOT NULL,
        last_heartbeat_at INTEGER NOT NULL,
        created_at        INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_processes_heartbeat ON durq_processes (last_heartbeat_at)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_ready_executions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id     INTEGER NOT NULL UNIQUE REFERENCES durq_jobs (id) ON DELETE CASCADE,
        queue_name TEXT    NOT NULL,
        priority   INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_ready_poll_all ON durq_ready_executions (priority DESC, job_id)",
    "CREATE INDEX IF NOT EXISTS durq_ready_poll_queue ON durq_ready_executions (queue_name, priority DESC, job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_scheduled_executions (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id       INTEGER NOT NULL UNIQUE REFERENCES durq_jobs (id) ON DELETE CASCADE,
        queue_name   TEXT    NOT NULL,
        priority     INTEGER NOT NULL,
        scheduled_at INTEGER NOT NULL,
        created_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_scheduled_dispatch ON durq_scheduled_executions (scheduled_at, priority DESC, job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_claimed_executions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id     INTEGER NOT NULL UNIQUE REFERENCES durq_jobs (id) ON DELETE CASCADE,
        process_id INTEGER NOT NULL REFERENCES durq_processes (id),
        queue_name TEXT    NOT NULL,
        priority   INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_claimed_process ON durq_claimed_executions (process_id, job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_blocked_executions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id          INTEGER NOT NULL UNIQUE REFERENCES durq_jobs (id) ON DELETE CASCADE,
        queue_name      TEXT    NOT NULL,
        priority        INTEGER NOT NULL,
        concurrency_key TEXT    NOT NULL,
        expires_at      INTEGER NOT NULL,
        created_at      INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_blocked_release ON durq_blocked_executions (concurrency_key, priority DESC, job_id)",
    "CREATE INDEX IF NOT EXISTS durq_blocked_expiry ON durq_blocked_executions (expires_at, concurrency_key)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_failed_executions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id     INTEGER NOT NULL UNIQUE REFERENCES durq_jobs (id) ON DELETE CASCADE,
        queue_name TEXT    NOT NULL,
        priority   INTEGER NOT NULL,
        error      TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS durq_paused_executions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id     INTEGER NOT NULL UNIQUE REFERENCES durq_jobs (id) ON DELETE CASCADE,
        queue_name TEXT    NOT NULL,
        priority   INTEGER NOT NULL,
        paused_at  INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_paused_queue ON durq_paused_executions (queue_name, job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_semaphores (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        key        TEXT    NOT NULL UNIQUE,
        value      INTEGER NOT NULL CHECK (value >= 0),
        expires_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS durq_semaphores_expiry ON durq_semaphores (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS durq_pauses (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        queue_name TEXT    NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    )
    "#,
];
