use axum::{
    Router,
    routing::{get, post},
};

pub mod events;
pub mod system;
pub mod uploads;

/// Router for every endpoint that needs the shared services.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/ready", get(system::ready))
        .route("/queue/stats", get(system::queue_stats))
        .route("/queue/sweep", post(system::sweep))
        .route("/notifications/stream", get(system::notifications))
        .nest("/uploads", uploads::router())
        .nest("/events", events::router())
}
