//! Redis pub/sub-backed notification bus.
//!
//! Pub/sub is not durable: subscribers that are offline miss messages. That
//! matches the notification contract (no ack, no replay).

use std::sync::mpsc;
use std::thread;

use redis::AsyncCommands;
use tracing::warn;

use ingest_events::{EventBus, Notification, Subscription};

use crate::redis_conn::RedisConnection;

pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "ingest:notifications";

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("publish requires a tokio runtime")]
    NoRuntime,
}

/// Redis pub/sub bus for [`Notification`]s, JSON encoded.
#[derive(Debug, Clone)]
pub struct RedisPubSubNotificationBus {
    redis: RedisConnection,
    channel: String,
}

impl RedisPubSubNotificationBus {
    pub fn new(redis: RedisConnection, channel: impl Into<String>) -> Self {
        Self {
            redis,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<Notification> for RedisPubSubNotificationBus {
    type Error = RedisBusError;

    /// Fire-and-forget: the message is handed to the multiplexed connection
    /// on a spawned task and delivery failures are only logged.
    fn publish(&self, message: Notification) -> Result<(), Self::Error> {
        let payload =
            serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| RedisBusError::NoRuntime)?;

        let mut conn = self.redis.conn();
        let channel = self.channel.clone();
        runtime.spawn(async move {
            if let Err(err) = conn.publish::<_, _, i64>(&channel, payload).await {
                warn!(channel = %channel, error = %err, "notification publish failed");
            }
        });
        Ok(())
    }

    fn subscribe(&self) -> Subscription<Notification> {
        let (tx, rx) = mpsc::channel();

        let client = self.redis.client().clone();
        let channel = self.channel.clone();

        // Dedicated blocking connection; pub/sub cannot share the multiplexed one.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    warn!(error = %err, "notification subscriber could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %err, "notification subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let notification: Notification = match serde_json::from_str(&payload) {
                    Ok(n) => n,
                    Err(_) => continue,
                };

                if tx.send(notification).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
