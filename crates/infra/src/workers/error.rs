use ingest_core::{Bucket, JobId, PayloadError};

use crate::dedup::LedgerError;
use crate::jobs::QueueError;
use crate::sinks::SinkError;
use crate::uploads::UploadError;

/// Fatal worker error.
///
/// A tick that returns one of these stops its worker; the supervisor decides
/// whether to restart it.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("persisting {bucket} batch failed: {source}")]
    Persistence {
        bucket: Bucket,
        #[source]
        source: SinkError,
    },

    #[error("job {job_id} has an undecodable payload: {source}")]
    Payload {
        job_id: JobId,
        #[source]
        source: PayloadError,
    },

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("worker {worker} panicked: {reason}")]
    Panicked { worker: String, reason: String },

    #[error("worker {worker} stopped after {restarts} restarts: {last}")]
    RestartsExhausted {
        worker: String,
        restarts: u32,
        last: Box<WorkerError>,
    },
}
