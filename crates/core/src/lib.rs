//! Queue model and state machine for durq.
//!
//! This crate has no I/O: job and process records, the error taxonomy,
//! configuration, retry/backoff math and the in-memory transition engine
//! that storage backends build on.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod outcome;
pub mod process;
pub mod retry;
pub mod selector;
pub mod semaphore;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use error::{ExecutionError, Missing, QueueError, QueueResult};
pub use id::{JobId, ProcessId};
pub use job::{IndexCounts, Job, JobStatus, NewJob, Rank};
pub use outcome::{ClaimBatch, Completion, ReapReport, SemaphoreExpiry};
pub use process::{NewProcess, Process, ProcessKind};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use selector::QueueSelector;
pub use semaphore::{ConcurrencyLimits, Semaphore};
pub use state::QueueState;
