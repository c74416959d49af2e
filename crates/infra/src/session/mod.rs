//! Upload session storage.
//!
//! An upload session is three keyed values sharing one rolling TTL window:
//!
//! - `{prefix}:{id}:chunks`: chunk index to bytes
//! - `{prefix}:{id}:meta`: `totalChunks` and `lastUpdated`
//! - `{prefix}:{id}:merged`: the concatenated blob, once merged
//!
//! `write_chunk` is the only way chunks enter a session and it is atomic: it
//! stores the chunk, refreshes the TTL and reports whether the field was newly
//! inserted together with the post-write cardinality. The reassembler enqueues
//! the merge job off that single answer.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use ingest_core::{UploadId, UploadKind};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemorySessionStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisSessionStore;

/// Addresses one kind of one upload session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub upload_id: UploadId,
    pub kind: UploadKind,
}

impl SessionKey {
    pub fn new(upload_id: UploadId, kind: UploadKind) -> Self {
        Self { upload_id, kind }
    }

    pub fn chunks_key(&self) -> String {
        self.key("chunks")
    }

    pub fn meta_key(&self) -> String {
        self.key("meta")
    }

    pub fn merged_key(&self) -> String {
        self.key("merged")
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{suffix}", self.kind.key_prefix(), self.upload_id)
    }
}

/// Outcome of an atomic chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    Stored {
        /// False when the index was already present (a retransmission).
        newly_inserted: bool,
        /// Chunk count after the write.
        uploaded: u32,
        total: u32,
    },
    /// The session already records a different `totalChunks`; nothing was written.
    TotalMismatch { recorded: u32 },
}

/// Session metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMeta {
    pub total_chunks: u32,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session backend error: {0}")]
    Backend(String),
    #[error("corrupt session {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Hash storage with per-key TTL for upload sessions.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Store `bytes` at `index`, record `total` on first write and refresh the
    /// TTL of the chunk map and metadata, atomically.
    async fn write_chunk(
        &self,
        key: &SessionKey,
        index: u32,
        bytes: Vec<u8>,
        total: u32,
        ttl: Duration,
    ) -> Result<ChunkWrite, SessionStoreError>;

    /// Metadata, or `None` once expired or never created.
    async fn meta(&self, key: &SessionKey) -> Result<Option<SessionMeta>, SessionStoreError>;

    async fn chunk_count(&self, key: &SessionKey) -> Result<u32, SessionStoreError>;

    /// Indices present, ascending.
    async fn chunk_indices(&self, key: &SessionKey) -> Result<Vec<u32>, SessionStoreError>;

    async fn read_chunks(
        &self,
        key: &SessionKey,
    ) -> Result<BTreeMap<u32, Vec<u8>>, SessionStoreError>;

    /// Store the merged blob with a fresh TTL.
    async fn write_merged(
        &self,
        key: &SessionKey,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), SessionStoreError>;

    async fn read_merged(&self, key: &SessionKey) -> Result<Option<Vec<u8>>, SessionStoreError>;

    async fn has_merged(&self, key: &SessionKey) -> Result<bool, SessionStoreError>;

    /// Delete chunks, metadata and merged blob.
    async fn delete(&self, key: &SessionKey) -> Result<(), SessionStoreError>;

    async fn ping(&self) -> Result<(), SessionStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_kind_prefix() {
        let id = UploadId::parse("abc-1").unwrap();
        let media = SessionKey::new(id.clone(), UploadKind::Media);
        let cover = SessionKey::new(id, UploadKind::Cover);

        assert_eq!(media.chunks_key(), "file:abc-1:chunks");
        assert_eq!(media.meta_key(), "file:abc-1:meta");
        assert_eq!(cover.merged_key(), "image:abc-1:merged");
    }
}
