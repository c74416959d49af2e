//! Redis-backed job queue.
//!
//! ## Layout
//!
//! - **Job hash**: `ingest:queue:{name}:job:{id}` with `topic`, `payload`, `created_at` (epoch ms)
//! - **Waiting set**: `ingest:queue:{name}:waiting`, sorted set scored by creation time
//! - **Active set**: `ingest:queue:{name}:active`, sorted set scored by claim time
//!
//! A job is waiting iff its id is in the waiting set. Claiming is a single
//! script (remove from waiting, add to active) so only one caller wins. The
//! sweep reaps both sets by score, so an active job whose worker died after
//! the claim is dropped once its claim is older than the sweep age.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use redis::AsyncCommands;
use tracing::instrument;

use ingest_core::{Clock, JobId, clock::to_chrono};

use super::store::{JobStore, QueueError};
use super::types::{Job, JobState, QueueStats};
use crate::redis_conn::RedisConnection;

const KEY_PREFIX: &str = "ingest:queue";

const CLAIM_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

pub struct RedisJobStore {
    redis: RedisConnection,
    name: String,
    clock: Arc<dyn Clock>,
    waiting_key: String,
    active_key: String,
    claim: redis::Script,
}

impl RedisJobStore {
    pub fn new(redis: RedisConnection, name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        Self {
            waiting_key: format!("{KEY_PREFIX}:{name}:waiting"),
            active_key: format!("{KEY_PREFIX}:{name}:active"),
            redis,
            name,
            clock,
            claim: redis::Script::new(CLAIM_SCRIPT),
        }
    }

    fn job_key(&self, id: &str) -> String {
        format!("{KEY_PREFIX}:{}:job:{id}", self.name)
    }

    /// Drop every member of `set` scored at or before `cutoff`, with its hash.
    async fn reap(&self, set: &str, cutoff: i64) -> Result<usize, QueueError> {
        let mut conn = self.redis.conn();
        let ids: Vec<String> = conn
            .zrangebyscore(set, "-inf", cutoff)
            .await
            .map_err(backend)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.zrem(set, id).del(self.job_key(id)).ignore();
        }
        let removed: Vec<i64> = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(removed.into_iter().filter(|n| *n > 0).count())
    }

    async fn load(&self, ids: Vec<String>, state: JobState) -> Result<Vec<Job>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.job_key(id));
        }
        let mut conn = self.redis.conn();
        let hashes: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(backend)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for (id, fields) in ids.into_iter().zip(hashes) {
            // Removed between ZRANGE and HGETALL.
            if fields.is_empty() {
                continue;
            }
            jobs.push(decode_job(&id, fields, state)?);
        }
        Ok(jobs)
    }
}

#[async_trait::async_trait]
impl JobStore for RedisJobStore {
    fn queue_name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, payload), err)]
    async fn enqueue(&self, topic: &str, payload: String) -> Result<JobId, QueueError> {
        let job = Job::new(topic, payload, self.clock.now());
        let id = job.id.to_string();
        let created_ms = job.created_at.timestamp_millis();

        let mut conn = self.redis.conn();
        redis::pipe()
            .atomic()
            .hset_multiple(
                self.job_key(&id),
                &[
                    ("topic", job.topic.clone()),
                    ("payload", job.payload.clone()),
                    ("created_at", created_ms.to_string()),
                ],
            )
            .ignore()
            .zadd(&self.waiting_key, &id, created_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend)?;

        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    async fn fetch_waiting(&self, batch_size: usize) -> Result<Vec<Job>, QueueError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.conn();
        let stop = isize::try_from(batch_size).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn
            .zrange(&self.waiting_key, 0, stop)
            .await
            .map_err(backend)?;
        self.load(ids, JobState::Waiting).await
    }

    async fn can_process(&self, job: &Job) -> Result<bool, QueueError> {
        let mut conn = self.redis.conn();
        let score: Option<f64> = conn
            .zscore(&self.waiting_key, job.id.to_string())
            .await
            .map_err(backend)?;
        Ok(score.is_some())
    }

    async fn claim(&self, job: &Job) -> Result<bool, QueueError> {
        let mut conn = self.redis.conn();
        let claimed: i64 = self
            .claim
            .key(&self.waiting_key)
            .key(&self.active_key)
            .arg(job.id.to_string())
            .arg(self.clock.now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(claimed == 1)
    }

    async fn remove(&self, job: &Job) -> Result<(), QueueError> {
        let id = job.id.to_string();
        let mut conn = self.redis.conn();
        redis::pipe()
            .atomic()
            .zrem(&self.waiting_key, &id)
            .ignore()
            .zrem(&self.active_key, &id)
            .ignore()
            .del(self.job_key(&id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend)
    }

    #[instrument(skip(self), err)]
    async fn sweep(&self, max_age: Duration) -> Result<usize, QueueError> {
        let cutoff = (self.clock.now() - to_chrono(max_age)).timestamp_millis();
        // Waiting scores are creation times, active scores claim times.
        let waiting = self.reap(&self.waiting_key, cutoff).await?;
        let active = self.reap(&self.active_key, cutoff).await?;
        Ok(waiting + active)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.conn();
        let (waiting, active): (usize, usize) = redis::pipe()
            .zcard(&self.waiting_key)
            .zcard(&self.active_key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(QueueStats {
            queue: self.name.clone(),
            waiting,
            active,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.redis.ping().await.map_err(backend)
    }
}

fn decode_job(id: &str, mut fields: HashMap<String, String>, state: JobState) -> Result<Job, QueueError> {
    let corrupt = |reason: &str| QueueError::Corrupt {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let job_id: JobId = id.parse().map_err(|_| corrupt("id is not a uuid"))?;
    let topic = fields.remove("topic").ok_or_else(|| corrupt("missing topic"))?;
    let payload = fields.remove("payload").ok_or_else(|| corrupt("missing payload"))?;
    let created_ms: i64 = fields
        .get("created_at")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| corrupt("missing created_at"))?;
    let created_at =
        DateTime::from_timestamp_millis(created_ms).ok_or_else(|| corrupt("created_at out of range"))?;

    Ok(Job {
        id: job_id,
        topic,
        payload,
        state,
        created_at,
        // Claim time lives in the active set score.
        claimed_at: None,
    })
}

fn backend(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_job_requires_all_fields() {
        let id = JobId::new().to_string();
        let mut fields = HashMap::new();
        fields.insert("topic".to_string(), "log_stream".to_string());
        fields.insert("payload".to_string(), "{}".to_string());
        fields.insert("created_at".to_string(), "1714557600000".to_string());

        let job = decode_job(&id, fields.clone(), JobState::Waiting).unwrap();
        assert_eq!(job.topic, "log_stream");
        assert_eq!(job.created_at.timestamp_millis(), 1_714_557_600_000);

        fields.remove("payload");
        assert!(matches!(
            decode_job(&id, fields, JobState::Waiting),
            Err(QueueError::Corrupt { .. })
        ));
    }
}
