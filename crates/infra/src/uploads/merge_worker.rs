use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ChunkReassembler, MERGE_TOPIC, MergeRequest};
use crate::jobs::JobStore;
use crate::workers::{PeriodicTask, WorkerError};

#[derive(Debug, Clone)]
pub struct MergeWorkerConfig {
    pub batch_size: usize,
    pub interval: Duration,
}

impl Default for MergeWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// Drains `merge-file` jobs: claim, merge, remove.
///
/// A merge that fails because of the upload (expired, incomplete) is logged
/// and the job dropped; the client can still force a merge or confirm. Queue
/// and session backend failures stop the worker.
pub struct MergeWorker {
    queue: Arc<dyn JobStore>,
    reassembler: Arc<ChunkReassembler>,
    config: MergeWorkerConfig,
}

impl MergeWorker {
    pub fn new(
        queue: Arc<dyn JobStore>,
        reassembler: Arc<ChunkReassembler>,
        config: MergeWorkerConfig,
    ) -> Self {
        Self {
            queue,
            reassembler,
            config,
        }
    }

    /// Process one batch; returns how many merges succeeded.
    pub async fn drain_once(&self) -> Result<usize, WorkerError> {
        let mut merged = 0;
        for job in self.queue.fetch_waiting(self.config.batch_size).await? {
            if job.topic != MERGE_TOPIC {
                warn!(job_id = %job.id, topic = %job.topic, "unexpected topic on merge queue, left for sweep");
                continue;
            }
            if !self.queue.claim(&job).await? {
                debug!(job_id = %job.id, "merge job claimed elsewhere");
                continue;
            }

            let request: MergeRequest = match serde_json::from_str(&job.payload) {
                Ok(request) => request,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "malformed merge job dropped");
                    self.queue.remove(&job).await?;
                    continue;
                }
            };

            match self
                .reassembler
                .merge_chunks(&request.upload_id, request.kind)
                .await
            {
                Ok(bytes) => {
                    merged += 1;
                    info!(job_id = %job.id, upload_id = %request.upload_id, bytes = bytes.len(), "merge job done");
                }
                Err(err) if err.is_backend() => {
                    // Best effort; the backend error is what gets reported.
                    if let Err(remove_err) = self.queue.remove(&job).await {
                        warn!(job_id = %job.id, error = %remove_err, "failed to remove merge job; left for the sweep");
                    }
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(job_id = %job.id, upload_id = %request.upload_id, error = %err, "merge failed, job dropped");
                }
            }
            self.queue.remove(&job).await?;
        }
        Ok(merged)
    }
}

#[async_trait::async_trait]
impl PeriodicTask for MergeWorker {
    fn name(&self) -> &str {
        "merge"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn tick(&self) -> Result<(), WorkerError> {
        self.drain_once().await.map(|_| ())
    }
}
