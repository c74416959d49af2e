//! Request/response DTOs and JSON mapping helpers.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use ingest_core::{AnalyticsEventRecord, Progress, UploadId, UploadKind};

use crate::app::errors;

pub fn parse_upload_id(raw: String) -> Result<UploadId, axum::response::Response> {
    UploadId::parse(raw)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_upload_id", e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct KindQuery {
    #[serde(default)]
    pub kind: UploadKind,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub total: u32,
    #[serde(default)]
    pub kind: UploadKind,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub upload_id: UploadId,
    pub kind: UploadKind,
    pub uploaded: u32,
    pub total: u32,
    pub percent: u32,
    pub complete: bool,
}

impl ProgressResponse {
    pub fn new(upload_id: UploadId, kind: UploadKind, progress: Progress) -> Self {
        Self {
            upload_id,
            kind,
            uploaded: progress.uploaded,
            total: progress.total,
            percent: progress.percent(),
            complete: progress.is_complete(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub upload_id: UploadId,
    pub kind: UploadKind,
    pub bytes: usize,
}

/// Echo of an accepted analytics event.
#[derive(Debug, Serialize)]
pub struct TrackedEvent {
    pub event_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub event_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&AnalyticsEventRecord> for TrackedEvent {
    fn from(event: &AnalyticsEventRecord) -> Self {
        Self {
            event_id: event.event_id.clone(),
            user_id: event.user_id.clone(),
            session_id: event.session_id.clone(),
            event_time: event.event_time,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TrackResponse {
    pub success: bool,
    pub processed_count: usize,
    pub events: Vec<TrackedEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    /// Overrides the configured max age for this run.
    pub max_age_secs: Option<u64>,
}
