//! Worker, dispatcher and supervisor runtimes for durq.
//!
//! These are periodic tokio tasks driving a [`durq_store::QueueStore`]:
//!
//! - [`Worker`] claims jobs and runs them through a [`HandlerRegistry`].
//! - [`Dispatcher`] promotes scheduled jobs, reaps dead processes and expires
//!   blocks and semaphores.
//! - [`Supervisor`] owns one dispatcher plus any number of workers and stops
//!   them together.

pub mod config;
pub mod dispatcher;
pub mod handler;
mod heartbeat;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use config::{DispatcherConfig, RuntimeConfig, WorkerConfig};
pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats, TickReport};
pub use handler::{HandlerRegistry, JobHandler};
pub use shutdown::install_shutdown_handler;
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorReport};
pub use worker::{Worker, WorkerHandle, WorkerStats};
