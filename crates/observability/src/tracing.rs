//! Tracing/logging initialization.
//!
//! Output is one JSON object per event. `RUST_LOG` overrides the default
//! filter, e.g. `RUST_LOG=ingest_infra=debug,sqlx=warn`.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Install the global JSON subscriber.
///
/// Returns `false` when a subscriber was already installed (tests, repeated
/// calls), in which case nothing changes.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init()
        .is_ok()
}
