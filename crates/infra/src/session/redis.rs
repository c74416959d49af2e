//! Redis-backed session store.
//!
//! Chunks live in a hash (`HSET {prefix}:{id}:chunks {index} {bytes}`),
//! metadata in a second hash, and the merged blob in a plain string key.
//! Bytes are stored raw; Redis strings are binary safe.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use redis::AsyncCommands;
use tracing::instrument;

use ingest_core::Clock;

use super::{ChunkWrite, SessionKey, SessionMeta, SessionStore, SessionStoreError};
use crate::redis_conn::RedisConnection;

/// Store one chunk, fix `totalChunks` on first write, refresh both TTLs and
/// report `{added, total, count}`. A total mismatch returns `{-1, recorded, 0}`.
const WRITE_CHUNK_SCRIPT: &str = r#"
local recorded = redis.call('HGET', KEYS[2], 'totalChunks')
if recorded and tonumber(recorded) ~= tonumber(ARGV[3]) then
  return {-1, tonumber(recorded), 0}
end
local added = redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], 'totalChunks', ARGV[3], 'lastUpdated', ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('EXPIRE', KEYS[2], ARGV[5])
return {added, tonumber(ARGV[3]), redis.call('HLEN', KEYS[1])}
"#;

pub struct RedisSessionStore {
    redis: RedisConnection,
    clock: Arc<dyn Clock>,
    write_chunk: redis::Script,
}

impl RedisSessionStore {
    pub fn new(redis: RedisConnection, clock: Arc<dyn Clock>) -> Self {
        Self {
            redis,
            clock,
            write_chunk: redis::Script::new(WRITE_CHUNK_SCRIPT),
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for RedisSessionStore {
    #[instrument(skip(self, bytes), fields(len = bytes.len()), err)]
    async fn write_chunk(
        &self,
        key: &SessionKey,
        index: u32,
        bytes: Vec<u8>,
        total: u32,
        ttl: Duration,
    ) -> Result<ChunkWrite, SessionStoreError> {
        let mut conn = self.redis.conn();
        let (added, total_seen, count): (i64, i64, i64) = self
            .write_chunk
            .key(key.chunks_key())
            .key(key.meta_key())
            .arg(index)
            .arg(bytes)
            .arg(total)
            .arg(self.clock.now().timestamp_millis())
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        let as_u32 = |n: i64| u32::try_from(n).unwrap_or(u32::MAX);
        if added < 0 {
            return Ok(ChunkWrite::TotalMismatch {
                recorded: as_u32(total_seen),
            });
        }
        Ok(ChunkWrite::Stored {
            newly_inserted: added == 1,
            uploaded: as_u32(count),
            total: as_u32(total_seen),
        })
    }

    async fn meta(&self, key: &SessionKey) -> Result<Option<SessionMeta>, SessionStoreError> {
        let mut conn = self.redis.conn();
        let fields: HashMap<String, String> =
            conn.hgetall(key.meta_key()).await.map_err(backend)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let corrupt = |reason: &str| SessionStoreError::Corrupt {
            key: key.meta_key(),
            reason: reason.to_string(),
        };
        let total_chunks = fields
            .get("totalChunks")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt("missing totalChunks"))?;
        let last_updated = fields
            .get("lastUpdated")
            .and_then(|v| v.parse().ok())
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| corrupt("missing lastUpdated"))?;

        Ok(Some(SessionMeta {
            total_chunks,
            last_updated,
        }))
    }

    async fn chunk_count(&self, key: &SessionKey) -> Result<u32, SessionStoreError> {
        let mut conn = self.redis.conn();
        conn.hlen(key.chunks_key()).await.map_err(backend)
    }

    async fn chunk_indices(&self, key: &SessionKey) -> Result<Vec<u32>, SessionStoreError> {
        let mut conn = self.redis.conn();
        let mut indices: Vec<u32> = conn.hkeys(key.chunks_key()).await.map_err(backend)?;
        indices.sort_unstable();
        Ok(indices)
    }

    #[instrument(skip(self), err)]
    async fn read_chunks(
        &self,
        key: &SessionKey,
    ) -> Result<BTreeMap<u32, Vec<u8>>, SessionStoreError> {
        let mut conn = self.redis.conn();
        conn.hgetall(key.chunks_key()).await.map_err(backend)
    }

    async fn write_merged(
        &self,
        key: &SessionKey,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), SessionStoreError> {
        let mut conn = self.redis.conn();
        conn.set_ex::<_, _, ()>(key.merged_key(), bytes, ttl_secs(ttl))
            .await
            .map_err(backend)
    }

    async fn read_merged(&self, key: &SessionKey) -> Result<Option<Vec<u8>>, SessionStoreError> {
        let mut conn = self.redis.conn();
        conn.get(key.merged_key()).await.map_err(backend)
    }

    async fn has_merged(&self, key: &SessionKey) -> Result<bool, SessionStoreError> {
        let mut conn = self.redis.conn();
        conn.exists(key.merged_key()).await.map_err(backend)
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), SessionStoreError> {
        let mut conn = self.redis.conn();
        conn.del::<_, ()>(&[key.chunks_key(), key.meta_key(), key.merged_key()])
            .await
            .map_err(backend)
    }

    async fn ping(&self) -> Result<(), SessionStoreError> {
        self.redis.ping().await.map_err(backend)
    }
}

/// `EXPIRE` takes whole seconds; a sub-second TTL still has to expire.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn backend(err: redis::RedisError) -> SessionStoreError {
    SessionStoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_at_least_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(1800)), 1800);
    }
}
