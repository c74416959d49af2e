//! Persistence sinks: durable targets for decoded records.
//!
//! A sink accepts one batch per call. Writes may be split into several
//! statements; when one of them fails the error reports how many leading rows
//! were durably written, so the caller can commit exactly those jobs. Only a
//! failure pinned to one row (`failed_row`) lets the caller give that row up;
//! anything else leaves the unwritten rows for a retry.

use ingest_core::JobRecord;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemorySink;
pub use postgres::{PostgresAnalyticsSink, PostgresRequestLogSink, ensure_schema};

/// A batch write failed after `rows_written` leading rows were persisted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("sink write failed after {rows_written} rows: {reason}")]
pub struct SinkError {
    pub rows_written: usize,
    /// Batch index of the row the sink refused, when the failure is that row's.
    pub failed_row: Option<usize>,
    pub reason: String,
}

impl SinkError {
    /// Failure not attributable to a row (connection, pool, timeout).
    pub fn new(rows_written: usize, reason: impl Into<String>) -> Self {
        Self {
            rows_written,
            failed_row: None,
            reason: reason.into(),
        }
    }

    /// The row at `index` was refused; every row before it was written.
    pub fn rejected(index: usize, reason: impl Into<String>) -> Self {
        Self {
            rows_written: index,
            failed_row: Some(index),
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait EventSink<R: Send + Sync>: Send + Sync {
    /// Sink name (table) for logs.
    fn name(&self) -> &str;

    /// Persist `rows` in order.
    async fn insert_batch(&self, rows: &[JobRecord<R>]) -> Result<(), SinkError>;
}
