//! Sink-side event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// One inbound API call, as captured by the request-logging middleware.
///
/// `body`, `response`, `error` and `query` are already serialized text; the
/// sink stores them verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status_code: u16,
    /// Handling time in milliseconds.
    #[serde(default)]
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub query: Option<String>,
}

impl RequestLogRecord {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Client-side analytics event (page views, clicks, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEventRecord {
    pub event_id: String,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
    #[serde(default)]
    pub sdk_version: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
}

/// A record together with the job it was decoded from.
///
/// Sinks keep the job id so a row can always be traced back to its delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord<R> {
    pub job_id: JobId,
    pub record: R,
}

impl<R> JobRecord<R> {
    pub fn new(job_id: JobId, record: R) -> Self {
        Self { job_id, record }
    }
}
