use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, sse::Event as SseEvent},
};
use serde_json::json;

use crate::app::dto::SweepRequest;
use crate::app::errors;
use crate::app::services::{self, AppServices};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "backend": services.backend,
    }))
}

/// 200 when every backend answers a ping, 503 listing the failures otherwise.
pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let failures = services.readiness().await;
    if failures.is_empty() {
        return Json(json!({ "status": "ready" })).into_response();
    }

    let failures: serde_json::Map<String, serde_json::Value> = failures
        .into_iter()
        .map(|(component, err)| (component.to_string(), json!(err)))
        .collect();
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "unavailable", "failures": failures })),
    )
        .into_response()
}

pub async fn queue_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queue_stats().await {
        Ok(stats) => Json(json!({ "queues": stats })).into_response(),
        Err(e) => errors::internal_error("queue_error", format!("{e:#}")),
    }
}

/// POST /queue/sweep
///
/// Body is optional; `{"max_age_secs": N}` overrides the configured age.
pub async fn sweep(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<SweepRequest>>,
) -> axum::response::Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let max_age = request
        .max_age_secs
        .map(Duration::from_secs)
        .unwrap_or(services.config.sweep_max_age);

    match services.sweeper.sweep_queues(max_age).await {
        Ok(report) => Json(json!({
            "removed": report.total_removed(),
            "queues": report
                .removed
                .iter()
                .map(|(queue, removed)| json!({ "queue": queue, "removed": removed }))
                .collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => errors::internal_error("sweep_error", e),
    }
}

/// GET /notifications/stream
pub async fn notifications(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    services::notification_sse_stream(&services)
}
