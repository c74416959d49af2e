//! Chunked uploads: reassembly, the merge job and its worker.
//!
//! ## Flow
//!
//! 1. `store_chunk` writes one chunk; the write that completes the set
//!    enqueues a `merge-file` job on the merge queue
//! 2. `MergeWorker` claims the job and calls `merge_chunks`
//! 3. `confirm_and_save` writes the merged blob(s) to the file store and
//!    deletes the session
//!
//! Sessions that are never confirmed expire with their TTL.

use serde::{Deserialize, Serialize};

use ingest_core::{UploadId, UploadKind};

use crate::files::FileStoreError;
use crate::jobs::QueueError;
use crate::session::SessionStoreError;

pub mod merge_worker;
pub mod reassembler;

pub use merge_worker::{MergeWorker, MergeWorkerConfig};
pub use reassembler::{ChunkReassembler, ReassemblerConfig};

/// Topic of merge jobs.
pub const MERGE_TOPIC: &str = "merge-file";

/// Queue merge jobs are enqueued on.
pub const MERGE_QUEUE: &str = "file-merge";

/// Payload of a `merge-file` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub upload_id: UploadId,
    pub kind: UploadKind,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload {0} has expired or does not exist")]
    Expired(UploadId),
    #[error("upload {upload_id} is incomplete: {} of {total} chunks missing", missing.len())]
    Incomplete {
        upload_id: UploadId,
        missing: Vec<u32>,
        total: u32,
    },
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    File(#[from] FileStoreError),
}

impl UploadError {
    /// Infrastructure failure, as opposed to a problem with the upload itself.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            UploadError::Session(_) | UploadError::Queue(_) | UploadError::File(_)
        )
    }
}
