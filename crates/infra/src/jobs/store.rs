//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use ingest_core::{Clock, JobId, SystemClock};

use super::types::{Job, JobState, QueueStats};

/// Durable job queue abstraction.
///
/// Jobs are either waiting or active; completion is modelled as absence, so
/// both success and give-up paths end in [`JobStore::remove`]. The store does
/// not lock jobs for processing: duplicate processing is prevented by the
/// dedup ledger, not here.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Name of the queue (for logs and stats).
    fn queue_name(&self) -> &str;

    /// Append a new waiting job.
    async fn enqueue(&self, topic: &str, payload: String) -> Result<JobId, QueueError>;

    /// Up to `batch_size` waiting jobs, oldest first.
    async fn fetch_waiting(&self, batch_size: usize) -> Result<Vec<Job>, QueueError>;

    /// True only if the job is still waiting at the instant of the check.
    async fn can_process(&self, job: &Job) -> Result<bool, QueueError>;

    /// Move a waiting job to active. Returns false if it was no longer waiting.
    async fn claim(&self, job: &Job) -> Result<bool, QueueError>;

    /// Delete the job regardless of its state. Removing a missing job is a no-op.
    async fn remove(&self, job: &Job) -> Result<(), QueueError>;

    /// Remove waiting jobs older than `max_age` and active jobs claimed more
    /// than `max_age` ago; returns how many were removed.
    async fn sweep(&self, max_age: Duration) -> Result<usize, QueueError>;

    /// Current queue statistics.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Queue backend error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    name: String,
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// Snapshot of every job regardless of state, oldest first.
    pub fn snapshot(&self) -> Vec<Job> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = jobs.values().cloned().collect();
        all.sort_by_key(|j| (j.created_at, j.id));
        all
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, topic: &str, payload: String) -> Result<JobId, QueueError> {
        let job = Job::new(topic, payload, self.clock.now());
        let id = job.id;
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, job);
        Ok(id)
    }

    async fn fetch_waiting(&self, batch_size: usize) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut waiting: Vec<_> = jobs
            .values()
            .filter(|j| j.state == JobState::Waiting)
            .cloned()
            .collect();

        // FIFO; ids are time-ordered and break ties.
        waiting.sort_by_key(|j| (j.created_at, j.id));
        waiting.truncate(batch_size);
        Ok(waiting)
    }

    async fn can_process(&self, job: &Job) -> Result<bool, QueueError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs
            .get(&job.id)
            .is_some_and(|j| j.state == JobState::Waiting))
    }

    async fn claim(&self, job: &Job) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&job.id) {
            Some(stored) if stored.state == JobState::Waiting => {
                stored.state = JobState::Active;
                stored.claimed_at = Some(self.clock.now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job.id);
        Ok(())
    }

    async fn sweep(&self, max_age: Duration) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, j| j.state_age(now) <= max_age);
        Ok(before - jobs.len())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = QueueStats {
            queue: self.name.clone(),
            ..Default::default()
        };
        for job in jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
            }
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::ManualClock;

    fn store_with_clock() -> (InMemoryJobStore, ManualClock) {
        let clock = ManualClock::default();
        let store = InMemoryJobStore::with_clock("redis", Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn fetch_waiting_is_oldest_first_and_bounded() {
        let (store, clock) = store_with_clock();
        let first = store.enqueue("log_stream", "1".into()).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let second = store.enqueue("log_stream", "2".into()).await.unwrap();
        clock.advance(Duration::from_secs(1));
        store.enqueue("log_stream", "3".into()).await.unwrap();

        let batch = store.fetch_waiting(2).await.unwrap();

        assert_eq!(batch.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first, second]);
    }

    #[tokio::test]
    async fn claimed_jobs_are_no_longer_processable() {
        let (store, _) = store_with_clock();
        store.enqueue("merge-file", "{}".into()).await.unwrap();
        let job = store.fetch_waiting(1).await.unwrap().remove(0);

        assert!(store.can_process(&job).await.unwrap());
        assert!(store.claim(&job).await.unwrap());
        assert!(!store.claim(&job).await.unwrap());
        assert!(!store.can_process(&job).await.unwrap());
        assert!(store.fetch_waiting(10).await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.waiting, stats.active), (0, 1));
    }

    #[tokio::test]
    async fn remove_is_unconditional_and_idempotent() {
        let (store, _) = store_with_clock();
        store.enqueue("log_stream", "{}".into()).await.unwrap();
        let job = store.fetch_waiting(1).await.unwrap().remove(0);
        store.claim(&job).await.unwrap();

        store.remove(&job).await.unwrap();
        store.remove(&job).await.unwrap();

        assert!(!store.contains(job.id));
        assert!(!store.can_process(&job).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_old_waiting_and_abandoned_active_jobs() {
        let (store, clock) = store_with_clock();
        store.enqueue("log_stream", "old".into()).await.unwrap();
        store.enqueue("merge-file", "abandoned".into()).await.unwrap();
        store.enqueue("merge-file", "late-claim".into()).await.unwrap();
        let waiting = store.fetch_waiting(10).await.unwrap();
        let by_payload = |payload: &str| waiting.iter().find(|j| j.payload == payload).unwrap().clone();
        store.claim(&by_payload("abandoned")).await.unwrap();

        // Claimed long after it was created: judged by the claim time.
        clock.advance(Duration::from_secs(90 * 60));
        store.claim(&by_payload("late-claim")).await.unwrap();
        clock.advance(Duration::from_secs(90 * 60));
        store.enqueue("log_stream", "fresh".into()).await.unwrap();

        let removed = store.sweep(Duration::from_secs(2 * 3600)).await.unwrap();

        assert_eq!(removed, 2);
        let left: Vec<_> = store.snapshot().into_iter().map(|j| j.payload).collect();
        assert_eq!(left, vec!["late-claim".to_string(), "fresh".to_string()]);
    }
}
