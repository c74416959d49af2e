//! Redis dedup ledger: one sorted set, member = job id, score = mark time (ms).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use ingest_core::{Clock, JobId};

use super::{DedupLedger, LedgerError};
use crate::redis_conn::RedisConnection;

pub const DEFAULT_LEDGER_KEY: &str = "processed_job_ids";

pub struct RedisDedupLedger {
    redis: RedisConnection,
    key: String,
    clock: Arc<dyn Clock>,
}

impl RedisDedupLedger {
    pub fn new(redis: RedisConnection, clock: Arc<dyn Clock>) -> Self {
        Self::with_key(redis, DEFAULT_LEDGER_KEY, clock)
    }

    pub fn with_key(redis: RedisConnection, key: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            redis,
            key: key.into(),
            clock,
        }
    }
}

#[async_trait::async_trait]
impl DedupLedger for RedisDedupLedger {
    async fn is_processed(&self, id: JobId) -> Result<bool, LedgerError> {
        let mut conn = self.redis.conn();
        let score: Option<f64> = conn.zscore(&self.key, id.to_string()).await.map_err(backend)?;
        Ok(score.is_some())
    }

    async fn mark_processed(&self, id: JobId) -> Result<(), LedgerError> {
        let mut conn = self.redis.conn();
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg("NX")
            .arg(self.clock.now().timestamp_millis())
            .arg(id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut conn = self.redis.conn();
        // Exclusive upper bound: entries marked exactly at the cutoff stay.
        let max = format!("({}", older_than.timestamp_millis());
        conn.zrembyscore(&self.key, "-inf", max).await.map_err(backend)
    }

    async fn len(&self) -> Result<usize, LedgerError> {
        let mut conn = self.redis.conn();
        conn.zcard(&self.key).await.map_err(backend)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.redis.ping().await.map_err(backend)
    }
}

fn backend(err: redis::RedisError) -> LedgerError {
    LedgerError::Backend(err.to_string())
}
