//! Process-wide logging setup shared by the ingest binaries.

/// Tracing subscriber configuration (filters, formatter).
pub mod tracing;

/// Initialize process-wide observability with the `info` default filter.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}
