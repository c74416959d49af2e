//! Periodic cleanup of stale queue entries and old dedup records.
//!
//! The sweep is purely age-based: a waiting job older than `max_age` is
//! removed whether it is an unclassifiable payload or an unprocessed backlog
//! entry, and an active job claimed more than `max_age` ago is treated as
//! abandoned. Dedup records are pruned after `dedup_retention`, which must be
//! longer than `max_age` so no job that could still be delivered loses its
//! record.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use ingest_core::{Clock, clock::to_chrono};

use crate::dedup::DedupLedger;
use crate::jobs::JobStore;
use crate::workers::{PeriodicTask, WorkerError};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub max_age: Duration,
    pub dedup_retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(2 * 60 * 60),
            dedup_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// `(queue, removed)` in queue order.
    pub removed: Vec<(String, usize)>,
    pub pruned_dedup: usize,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.removed.iter().map(|(_, n)| n).sum()
    }
}

pub struct Sweeper {
    queues: Vec<Arc<dyn JobStore>>,
    ledger: Arc<dyn DedupLedger>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(
        queues: Vec<Arc<dyn JobStore>>,
        ledger: Arc<dyn DedupLedger>,
        clock: Arc<dyn Clock>,
        config: SweepConfig,
    ) -> Self {
        Self {
            queues,
            ledger,
            clock,
            config,
        }
    }

    /// Sweep every queue, then prune the ledger.
    pub async fn sweep_once(&self) -> Result<SweepReport, WorkerError> {
        let mut report = SweepReport::default();
        for queue in &self.queues {
            let removed = queue.sweep(self.config.max_age).await?;
            if removed > 0 {
                warn!(queue = %queue.queue_name(), removed, "swept stale waiting jobs");
            }
            report.removed.push((queue.queue_name().to_string(), removed));
        }

        let cutoff = self.clock.now() - to_chrono(self.config.dedup_retention);
        report.pruned_dedup = self.ledger.prune(cutoff).await?;

        info!(
            removed = report.total_removed(),
            pruned_dedup = report.pruned_dedup,
            "sweep finished"
        );
        Ok(report)
    }

    /// Sweep the queues only, with a caller-chosen age (on-demand cleanup).
    pub async fn sweep_queues(&self, max_age: Duration) -> Result<SweepReport, WorkerError> {
        let mut report = SweepReport::default();
        for queue in &self.queues {
            let removed = queue.sweep(max_age).await?;
            report.removed.push((queue.queue_name().to_string(), removed));
        }
        info!(removed = report.total_removed(), max_age_secs = max_age.as_secs(), "manual sweep finished");
        Ok(report)
    }
}

#[async_trait::async_trait]
impl PeriodicTask for Sweeper {
    fn name(&self) -> &str {
        "sweeper"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn tick(&self) -> Result<(), WorkerError> {
        self.sweep_once().await.map(|_| ())
    }
}
