use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ingest_core::{Bucket, Clock, IngestPayload, JobRecord};
use ingest_events::{
    MonitorUpdate, MonitorUpdateKind, Notification, NotificationPublisher, SyncComplete,
};

use super::SyncFamily;
use crate::dedup::DedupLedger;
use crate::jobs::{Job, JobStore};
use crate::workers::{PeriodicTask, WorkerError};

#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    pub batch_size: usize,
    pub interval: Duration,
    /// Publish a `monitorUpdate` per persisted log bucket.
    pub bucket_updates: bool,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            interval: Duration::from_secs(10),
            bucket_updates: false,
        }
    }
}

/// What one tick did with the jobs it fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    /// Persisted and removed.
    pub persisted: usize,
    /// Already in the ledger; removed without processing.
    pub duplicates: usize,
    /// No longer waiting at check time.
    pub skipped: usize,
    /// Owned by another family; left waiting.
    pub foreign: usize,
    /// Matched no known shape; left waiting.
    pub unknown: usize,
}

#[derive(Default)]
struct Batch {
    jobs: Vec<Job>,
    rows: Vec<JobRecord<IngestPayload>>,
}

/// Drains waiting jobs of one event family into its sink.
///
/// Each tick: fetch a batch, drop jobs already in the dedup ledger, classify
/// the rest, bulk-persist every accepted bucket, then mark and remove the
/// persisted jobs. A decode failure, or a sink failure pinned to one row, gives
/// up that job; any failure keeps everything committed before it and stops
/// the worker with the error.
pub struct SyncWorker {
    family: Arc<dyn SyncFamily>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn DedupLedger>,
    notifier: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
    config: SyncWorkerConfig,
    tick_lock: Mutex<()>,
}

impl SyncWorker {
    pub fn new(
        family: Arc<dyn SyncFamily>,
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn DedupLedger>,
        notifier: Arc<dyn NotificationPublisher>,
        clock: Arc<dyn Clock>,
        config: SyncWorkerConfig,
    ) -> Self {
        Self {
            family,
            jobs,
            ledger,
            notifier,
            clock,
            config,
            tick_lock: Mutex::new(()),
        }
    }

    pub async fn sync_once(&self) -> Result<TickReport, WorkerError> {
        let _guard = self.tick_lock.lock().await;
        let name = self.family.name();

        let fetched = self.jobs.fetch_waiting(self.config.batch_size).await?;
        let mut report = TickReport {
            fetched: fetched.len(),
            ..TickReport::default()
        };
        let mut buckets: BTreeMap<Bucket, Batch> = BTreeMap::new();
        let mut give_up: Vec<Job> = Vec::new();
        let mut failure: Option<WorkerError> = None;

        for job in fetched {
            if self.ledger.is_processed(job.id).await? {
                self.jobs.remove(&job).await?;
                report.duplicates += 1;
                debug!(worker = %name, job_id = %job.id, "duplicate delivery removed");
                continue;
            }
            if !self.jobs.can_process(&job).await? {
                report.skipped += 1;
                continue;
            }

            match IngestPayload::classify(&job.topic, &job.payload) {
                Ok(IngestPayload::Unknown { reason }) => {
                    report.unknown += 1;
                    warn!(worker = %name, job_id = %job.id, topic = %job.topic, reason = %reason, "unclassifiable job left waiting");
                }
                Ok(payload) => match payload.bucket() {
                    Some(bucket) if self.family.accepts(bucket) => {
                        let batch = buckets.entry(bucket).or_default();
                        batch.rows.push(JobRecord::new(job.id, payload));
                        batch.jobs.push(job);
                    }
                    _ => report.foreign += 1,
                },
                Err(err) => {
                    let owned = match err.bucket() {
                        Some(bucket) => self.family.accepts(bucket),
                        None => self.family.owns_malformed(),
                    };
                    if !owned {
                        report.foreign += 1;
                        continue;
                    }
                    failure = Some(WorkerError::Payload {
                        job_id: job.id,
                        source: err,
                    });
                    give_up.push(job);
                    break;
                }
            }
        }

        let mut summary = SyncComplete::empty(name, self.clock.now());
        let mut persisted: Vec<(Bucket, usize)> = Vec::new();

        for (bucket, batch) in buckets {
            let n = batch.jobs.len();
            match self.family.persist(bucket, batch.rows).await {
                Ok(()) => {
                    if let Err(err) = self.commit(&batch.jobs).await {
                        failure.get_or_insert(err);
                        break;
                    }
                    summary.record(bucket, n);
                    persisted.push((bucket, n));
                }
                Err(err) => {
                    let written = err.rows_written.min(n);
                    if let Err(commit_err) = self.commit(&batch.jobs[..written]).await {
                        failure.get_or_insert(commit_err);
                        break;
                    }
                    if written > 0 {
                        summary.record(bucket, written);
                        persisted.push((bucket, written));
                    }
                    // Unattributed failures give nothing up; the restart retries.
                    if let Some(job) = err
                        .failed_row
                        .filter(|&row| row >= written)
                        .and_then(|row| batch.jobs.get(row))
                    {
                        give_up.push(job.clone());
                    }
                    failure.get_or_insert(WorkerError::Persistence {
                        bucket,
                        source: err,
                    });
                    break;
                }
            }
        }

        report.persisted = summary.processed_count;
        if summary.processed_count > 0 {
            info!(
                worker = %name,
                processed = summary.processed_count,
                requests = summary.request_count,
                errors = summary.error_count,
                analytics = summary.analytics_count,
                "batch synced"
            );
            self.publish_committed(summary, &persisted);
        }

        for job in give_up {
            self.give_up(&job).await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Ledger first, then removal: a crash in between leaves a job that the
    /// next tick drops as a duplicate.
    async fn commit(&self, jobs: &[Job]) -> Result<(), WorkerError> {
        for job in jobs {
            self.ledger.mark_processed(job.id).await?;
            self.jobs.remove(job).await?;
        }
        Ok(())
    }

    /// Best effort: the worker is already failing with a better error.
    async fn give_up(&self, job: &Job) {
        if let Err(err) = self.ledger.mark_processed(job.id).await {
            warn!(worker = %self.family.name(), job_id = %job.id, error = %err, "failed to mark given-up job");
        }
        if let Err(err) = self.jobs.remove(job).await {
            warn!(worker = %self.family.name(), job_id = %job.id, error = %err, "failed to remove given-up job");
        }
        warn!(worker = %self.family.name(), job_id = %job.id, topic = %job.topic, "job given up");
    }

    /// Post-commit hook. Failures here are logged, never returned.
    fn publish_committed(&self, summary: SyncComplete, persisted: &[(Bucket, usize)]) {
        let timestamp = summary.timestamp;
        let mut notes = Vec::with_capacity(persisted.len() + 1);
        if self.config.bucket_updates {
            for (bucket, count) in persisted {
                let kind = match bucket {
                    Bucket::Request => MonitorUpdateKind::BatchRequest,
                    Bucket::Error => MonitorUpdateKind::BatchError,
                    Bucket::Analytics => continue,
                };
                notes.push(Notification::MonitorUpdate(MonitorUpdate {
                    kind,
                    count: *count,
                    timestamp,
                }));
            }
        }
        notes.push(Notification::SyncComplete(summary));

        for note in notes {
            let name = note.name();
            if let Err(err) = self.notifier.publish_notification(note) {
                warn!(worker = %self.family.name(), notification = name, error = %err, "notification dropped");
            }
        }
    }
}

#[async_trait::async_trait]
impl PeriodicTask for SyncWorker {
    fn name(&self) -> &str {
        self.family.name()
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn tick(&self) -> Result<(), WorkerError> {
        let report = self.sync_once().await?;
        if report.fetched > 0 {
            debug!(worker = %self.family.name(), ?report, "tick finished");
        }
        Ok(())
    }
}
