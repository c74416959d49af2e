//! Queue-to-sink synchronisation.
//!
//! One [`SyncWorker`] per event family. Both instances poll the same waiting
//! set and partition it by payload shape: log sync takes request and error
//! records, event sync takes analytics events, and each leaves the other's
//! jobs untouched.

pub mod family;
pub mod worker;

pub use family::{AnalyticsSync, LogSync, SyncFamily};
pub use worker::{SyncWorker, SyncWorkerConfig, TickReport};
