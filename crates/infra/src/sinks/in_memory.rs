use std::sync::{PoisonError, RwLock};

use ingest_core::JobRecord;

use super::{EventSink, SinkError};

/// Append-only sink for tests/dev. Duplicate deliveries show up as duplicate
/// rows, which is what dedup tests look for.
#[derive(Debug)]
pub struct InMemorySink<R> {
    name: String,
    rows: RwLock<Vec<JobRecord<R>>>,
}

impl<R: Clone> InMemorySink<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(Vec::new()),
        }
    }

    pub fn rows(&self) -> Vec<JobRecord<R>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl<R: Clone + Send + Sync> EventSink<R> for InMemorySink<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_batch(&self, rows: &[JobRecord<R>]) -> Result<(), SinkError> {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(rows);
        Ok(())
    }
}
