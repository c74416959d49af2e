use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use ingest_core::{Clock, JobId, SystemClock};

use super::{DedupLedger, LedgerError};

#[derive(Debug)]
pub struct InMemoryDedupLedger {
    clock: Arc<dyn Clock>,
    marked: RwLock<HashMap<JobId, DateTime<Utc>>>,
}

impl InMemoryDedupLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            marked: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDedupLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DedupLedger for InMemoryDedupLedger {
    async fn is_processed(&self, id: JobId) -> Result<bool, LedgerError> {
        Ok(self
            .marked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id))
    }

    async fn mark_processed(&self, id: JobId) -> Result<(), LedgerError> {
        let now = self.clock.now();
        self.marked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(now);
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut marked = self.marked.write().unwrap_or_else(PoisonError::into_inner);
        let before = marked.len();
        marked.retain(|_, at| *at >= older_than);
        Ok(before - marked.len())
    }

    async fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.marked.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use ingest_core::ManualClock;

    #[tokio::test]
    async fn marks_are_idempotent_and_prunable() {
        let clock = ManualClock::default();
        let ledger = InMemoryDedupLedger::with_clock(Arc::new(clock.clone()));
        let old = JobId::new();
        let fresh = JobId::new();

        ledger.mark_processed(old).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        ledger.mark_processed(old).await.unwrap();
        ledger.mark_processed(fresh).await.unwrap();

        assert!(ledger.is_processed(old).await.unwrap());
        assert_eq!(ledger.len().await.unwrap(), 2);

        let pruned = ledger.prune(clock.now() - chrono::Duration::minutes(30)).await.unwrap();

        assert_eq!(pruned, 1);
        assert!(!ledger.is_processed(old).await.unwrap());
        assert!(ledger.is_processed(fresh).await.unwrap());
    }
}
