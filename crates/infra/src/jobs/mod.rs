//! Durable job queue.
//!
//! ## Design
//!
//! - A queue holds waiting and active jobs; finished jobs are deleted
//! - Ordering is by creation time (oldest first)
//! - No processing lock: workers combine `can_process` with the dedup ledger
//! - Stale waiting jobs are swept after a maximum age
//!
//! ## Components
//!
//! - `Job`: id, topic, opaque payload, state, creation time
//! - `JobStore`: queue contract (in-memory, or Redis with the `redis` feature)
//! - `RetryPolicy`: backoff used by the worker supervisor

#[cfg(feature = "redis")]
pub mod redis;
pub mod store;
pub mod types;

#[cfg(feature = "redis")]
pub use self::redis::RedisJobStore;
pub use store::{InMemoryJobStore, JobStore, QueueError};
pub use types::{BackoffStrategy, Job, JobState, QueueStats, RetryPolicy};
