//! `ingest-core`: domain building blocks for the ingest pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the clock abstraction, upload session values, sink-side
//! records, and the payload classification applied at the queue boundary.

pub mod clock;
pub mod error;
pub mod id;
pub mod payload;
pub mod record;
pub mod upload;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, UploadId};
pub use payload::{Bucket, IngestPayload, PayloadError};
pub use record::{AnalyticsEventRecord, JobRecord, RequestLogRecord};
pub use upload::{ChunkStatus, Progress, SavedUpload, UploadKind};
