//! Infrastructure layer: queues, session storage, sinks, workers.
//!
//! Every backend sits behind a trait with an in-memory implementation for
//! dev/tests; Redis implementations are enabled with the `redis` feature and
//! Postgres sinks are always available.

pub mod dedup;
pub mod event_bus;
pub mod files;
pub mod jobs;
pub mod session;
pub mod sinks;
pub mod sweep;
pub mod sync;
pub mod uploads;
pub mod workers;

#[cfg(feature = "redis")]
pub mod redis_conn;
