//! Event families: which buckets a sync worker owns and where they go.

use std::sync::Arc;

use ingest_core::{AnalyticsEventRecord, Bucket, IngestPayload, JobRecord, RequestLogRecord};

use crate::sinks::{EventSink, SinkError};

/// One family of events drained by one sync worker instance.
#[async_trait::async_trait]
pub trait SyncFamily: Send + Sync {
    fn name(&self) -> &str;

    /// Whether jobs classified into `bucket` belong to this family.
    fn accepts(&self, bucket: Bucket) -> bool;

    /// Whether payloads that are not even valid JSON are this family's
    /// failure to report. Exactly one family should claim them.
    fn owns_malformed(&self) -> bool {
        false
    }

    /// Persist one bucket. `batch` only holds payloads of `bucket`.
    async fn persist(
        &self,
        bucket: Bucket,
        batch: Vec<JobRecord<IngestPayload>>,
    ) -> Result<(), SinkError>;
}

/// Operational logs: successful and failed API calls.
pub struct LogSync {
    sink: Arc<dyn EventSink<RequestLogRecord>>,
}

impl LogSync {
    pub fn new(sink: Arc<dyn EventSink<RequestLogRecord>>) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl SyncFamily for LogSync {
    fn name(&self) -> &str {
        "log-sync"
    }

    fn accepts(&self, bucket: Bucket) -> bool {
        matches!(bucket, Bucket::Request | Bucket::Error)
    }

    fn owns_malformed(&self) -> bool {
        true
    }

    async fn persist(
        &self,
        bucket: Bucket,
        batch: Vec<JobRecord<IngestPayload>>,
    ) -> Result<(), SinkError> {
        let rows = batch
            .into_iter()
            .map(|row| match row.record {
                IngestPayload::Request(record) | IngestPayload::Error(record) => {
                    Ok(JobRecord::new(row.job_id, record))
                }
                _ => Err(unexpected(bucket, self.sink.name())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.sink.insert_batch(&rows).await
    }
}

/// Client analytics events.
pub struct AnalyticsSync {
    sink: Arc<dyn EventSink<AnalyticsEventRecord>>,
}

impl AnalyticsSync {
    pub fn new(sink: Arc<dyn EventSink<AnalyticsEventRecord>>) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl SyncFamily for AnalyticsSync {
    fn name(&self) -> &str {
        "event-sync"
    }

    fn accepts(&self, bucket: Bucket) -> bool {
        bucket == Bucket::Analytics
    }

    async fn persist(
        &self,
        bucket: Bucket,
        batch: Vec<JobRecord<IngestPayload>>,
    ) -> Result<(), SinkError> {
        let rows = batch
            .into_iter()
            .map(|row| match row.record {
                IngestPayload::Analytics(record) => Ok(JobRecord::new(row.job_id, record)),
                _ => Err(unexpected(bucket, self.sink.name())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.sink.insert_batch(&rows).await
    }
}

fn unexpected(bucket: Bucket, sink: &str) -> SinkError {
    SinkError::new(0, format!("{bucket} payload routed to {sink}"))
}
