//! Shared Redis connection for the Redis-backed stores.
//!
//! One multiplexed connection is opened at startup and cloned into every
//! store; clones share the same underlying socket.

use redis::aio::MultiplexedConnection;

/// Default connection URL when none is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Cloneable handle to a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisConnection {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisConnection {
    /// Open a client and establish the multiplexed connection.
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { client, conn })
    }

    /// A connection handle for one operation.
    pub fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// The underlying client (pub/sub needs dedicated connections).
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

impl core::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}
