//! Dedup ledger: job ids whose effect has already been applied.
//!
//! An entry is written immediately after the effect (a sink write) and before
//! the job is removed from the queue. A redelivered job whose id is present is
//! removed without being processed again, which turns at-least-once delivery
//! into at-most-once effect.
//!
//! Entries carry their mark time so they can be pruned once they are far older
//! than anything the queue could still redeliver.

use chrono::{DateTime, Utc};

use ingest_core::JobId;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryDedupLedger;
#[cfg(feature = "redis")]
pub use self::redis::RedisDedupLedger;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("dedup ledger backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait DedupLedger: Send + Sync {
    async fn is_processed(&self, id: JobId) -> Result<bool, LedgerError>;

    /// Record `id` as applied. Marking an id twice keeps the first mark time.
    async fn mark_processed(&self, id: JobId) -> Result<(), LedgerError>;

    /// Forget entries marked before `older_than`; returns how many were dropped.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, LedgerError>;

    async fn len(&self) -> Result<usize, LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError>;
}
