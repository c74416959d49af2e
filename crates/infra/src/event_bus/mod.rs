//! Infrastructure notification bus implementations.
//!
//! The bus abstraction lives in `ingest-events` as pure mechanics. This
//! module provides the Redis-backed implementation.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{DEFAULT_NOTIFICATION_CHANNEL, RedisBusError, RedisPubSubNotificationBus};
