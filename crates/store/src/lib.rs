//! Queue persistence for durq.
//!
//! [`QueueStore`] is the storage contract the worker and dispatcher loops are
//! written against. Two implementations ship here:
//!
//! - [`InMemoryQueueStore`]: a mutex around the core state machine.
//! - [`SqliteQueueStore`] (feature `sqlite`, on by default): durable storage
//!   where each operation is one SQLite transaction.

pub mod in_memory;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryQueueStore;
pub use store::QueueStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQueueStore;
