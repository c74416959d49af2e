//! Messages broadcast on the notification bus.
//!
//! Wire shape: `{"name": "syncComplete", "data": {...}}` with camelCase fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingest_core::Bucket;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum Notification {
    #[serde(rename = "monitorUpdate")]
    MonitorUpdate(MonitorUpdate),
    #[serde(rename = "syncComplete")]
    SyncComplete(SyncComplete),
}

impl Notification {
    /// Message name as seen by subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            Notification::MonitorUpdate(_) => "monitorUpdate",
            Notification::SyncComplete(_) => "syncComplete",
        }
    }
}

/// Summary of one sync tick that persisted at least one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncComplete {
    /// Worker that produced the tick.
    pub worker: String,
    pub processed_count: usize,
    pub request_count: usize,
    pub error_count: usize,
    pub analytics_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl SyncComplete {
    pub fn empty(worker: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            worker: worker.into(),
            processed_count: 0,
            request_count: 0,
            error_count: 0,
            analytics_count: 0,
            timestamp,
        }
    }

    /// Count `n` persisted rows for `bucket`.
    pub fn record(&mut self, bucket: Bucket, n: usize) {
        match bucket {
            Bucket::Request => self.request_count += n,
            Bucket::Error => self.error_count += n,
            Bucket::Analytics => self.analytics_count += n,
        }
        self.processed_count += n;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorUpdateKind {
    BatchRequest,
    BatchError,
}

/// Per-bucket update for monitoring dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorUpdate {
    #[serde(rename = "type")]
    pub kind: MonitorUpdateKind,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}
