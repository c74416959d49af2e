//! Request-log producer.
//!
//! Every inbound request, successful or not, becomes exactly one `log_stream`
//! job on the shared queue once its response is ready. JSON request and
//! response bodies up to the configured limit are captured as text; anything
//! larger, streamed or non-JSON is recorded as absent.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::{debug, warn};

use ingest_core::RequestLogRecord;
use ingest_core::payload::REQUEST_LOG_TOPIC;
use ingest_infra::jobs::JobStore;

#[derive(Clone)]
pub struct RequestLogState {
    pub queue: Arc<dyn JobStore>,
    pub body_limit: usize,
}

pub async fn request_log_middleware(
    State(state): State<RequestLogState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let url = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let (req, body) = capture_request(req, state.body_limit).await;
    let response = next.run(req).await;
    let (response, response_body) = capture_response(response, state.body_limit).await;

    let status = response.status();
    let (response_text, error) = if status.is_client_error() || status.is_server_error() {
        let message = response_body.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
        (None, Some(message))
    } else {
        (response_body, None)
    };

    let record = RequestLogRecord {
        method,
        url,
        body,
        response: response_text,
        error,
        status_code: status.as_u16(),
        duration: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
        query,
    };

    // Off the response path; a lost log entry never fails the request.
    let queue = state.queue.clone();
    tokio::spawn(async move {
        let payload = match serde_json::to_string(&record) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "request log not serializable");
                return;
            }
        };
        match queue.enqueue(REQUEST_LOG_TOPIC, payload).await {
            Ok(job_id) => debug!(%job_id, url = %record.url, "request log queued"),
            Err(err) => warn!(error = %err, url = %record.url, "request log dropped"),
        }
    });

    response
}

async fn capture_request(req: Request<Body>, limit: usize) -> (Request<Body>, Option<String>) {
    if !capturable(req.headers(), req.body().size_hint().exact(), limit) {
        return (req, None);
    }
    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (Request::from_parts(parts, Body::from(bytes)), Some(text))
        }
        // The size hint was exact, so this only happens on a broken stream.
        Err(err) => {
            warn!(error = %err, "request body unreadable");
            (Request::from_parts(parts, Body::empty()), None)
        }
    }
}

async fn capture_response(response: Response, limit: usize) -> (Response, Option<String>) {
    if !capturable(response.headers(), response.body().size_hint().exact(), limit) {
        return (response, None);
    }
    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (Response::from_parts(parts, Body::from(bytes)), Some(text))
        }
        Err(err) => {
            warn!(error = %err, "response body unreadable");
            (Response::from_parts(parts, Body::empty()), None)
        }
    }
}

/// JSON with a known length within `limit`.
fn capturable(headers: &HeaderMap, exact_len: Option<u64>, limit: usize) -> bool {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    is_json && exact_len.or(declared).is_some_and(|len| len <= limit as u64)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{Json, Router, http::StatusCode, routing::get, routing::post};
    use ingest_core::IngestPayload;
    use ingest_infra::jobs::InMemoryJobStore;
    use tower::ServiceExt;

    use super::*;

    fn app(queue: Arc<InMemoryJobStore>, body_limit: usize) -> Router {
        Router::new()
            .route("/echo", post(|Json(v): Json<serde_json::Value>| async move { Json(v) }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .layer(axum::middleware::from_fn_with_state(
                RequestLogState { queue, body_limit },
                request_log_middleware,
            ))
    }

    async fn logged(queue: &InMemoryJobStore) -> RequestLogRecord {
        for _ in 0..100 {
            if let Some(job) = queue.snapshot().pop() {
                assert_eq!(job.topic, REQUEST_LOG_TOPIC);
                return match IngestPayload::classify(&job.topic, &job.payload).unwrap() {
                    IngestPayload::Request(r) | IngestPayload::Error(r) => r,
                    other => panic!("unexpected payload: {other:?}"),
                };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no request log was queued");
    }

    #[tokio::test]
    async fn successful_json_call_is_logged_with_bodies() {
        let queue = InMemoryJobStore::arc("redis");
        let req = Request::post("/echo?x=1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"a":1}"#))
            .unwrap();

        let res = app(queue.clone(), 1024).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let echoed = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(&echoed[..], br#"{"a":1}"#);

        let record = logged(&queue).await;
        assert_eq!(record.method, "POST");
        assert_eq!(record.url, "/echo");
        assert_eq!(record.query.as_deref(), Some("x=1"));
        assert_eq!(record.body.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(record.response.as_deref(), Some(r#"{"a":1}"#));
        assert!(record.error.is_none());
        assert_eq!(queue.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn failed_call_is_logged_as_error() {
        let queue = InMemoryJobStore::arc("redis");
        let req = Request::get("/missing").body(Body::empty()).unwrap();

        let res = app(queue.clone(), 1024).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let record = logged(&queue).await;
        assert!(record.is_error());
        assert_eq!(record.status_code, 404);
        assert!(record.response.is_none());
    }

    #[tokio::test]
    async fn bodies_over_the_limit_pass_through_uncaptured() {
        let queue = InMemoryJobStore::arc("redis");
        let big = format!(r#"{{"pad":"{}"}}"#, "x".repeat(100));
        let req = Request::post("/echo")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(big.clone()))
            .unwrap();

        let res = app(queue.clone(), 16).oneshot(req).await.unwrap();
        let echoed = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(echoed.len(), big.len());

        let record = logged(&queue).await;
        assert!(record.body.is_none());
        assert!(record.response.is_none());
    }
}
