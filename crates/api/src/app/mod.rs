//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend wiring (queues, session store, sinks, bus) and worker startup
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};

use crate::middleware::{RequestLogState, request_log_middleware};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router around already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let request_log = RequestLogState {
        queue: services.log_queue.clone(),
        body_limit: services.config.request_log_body_limit,
    };

    routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            request_log,
            request_log_middleware,
        ))
}
