//! Analytics ingest endpoints.
//!
//! Events are not written directly: each one becomes a `tracker_event` job on
//! the shared log queue and is persisted by the event sync worker.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use ingest_core::AnalyticsEventRecord;
use ingest_core::payload::ANALYTICS_TOPIC;

use crate::app::dto::{TrackResponse, TrackedEvent};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/single", post(track_single))
        .route("/batch", post(track_batch))
}

/// POST /events/single
pub async fn track_single(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<AnalyticsEventRecord>,
) -> axum::response::Response {
    track(&services, vec![event]).await
}

/// POST /events/batch
pub async fn track_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(events): Json<Vec<AnalyticsEventRecord>>,
) -> axum::response::Response {
    track(&services, events).await
}

async fn track(services: &AppServices, events: Vec<AnalyticsEventRecord>) -> axum::response::Response {
    if let Some(pos) = events.iter().position(|e| e.event_id.trim().is_empty()) {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("event {pos}: event_id must not be empty"),
        );
    }

    // A queue failure midway leaves the earlier events queued.
    for event in &events {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => return errors::internal_error("serialize_error", e),
        };
        if let Err(e) = services.log_queue.enqueue(ANALYTICS_TOPIC, payload).await {
            return errors::internal_error("queue_error", e);
        }
    }

    (
        StatusCode::CREATED,
        Json(TrackResponse {
            success: true,
            processed_count: events.len(),
            events: events.iter().map(TrackedEvent::from).collect(),
        }),
    )
        .into_response()
}
