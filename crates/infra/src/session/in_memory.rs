//! In-memory session store with clock-driven expiry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use ingest_core::{Clock, SystemClock, clock::to_chrono};

use super::{ChunkWrite, SessionKey, SessionMeta, SessionStore, SessionStoreError};

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Sessions {
    chunks: HashMap<SessionKey, Expiring<BTreeMap<u32, Vec<u8>>>>,
    meta: HashMap<SessionKey, Expiring<SessionMeta>>,
    merged: HashMap<SessionKey, Expiring<Vec<u8>>>,
}

impl Sessions {
    /// Drop whatever has expired for `key`, as the backend would have.
    fn expire(&mut self, key: &SessionKey, now: DateTime<Utc>) {
        if self.chunks.get(key).is_some_and(|e| !e.live(now)) {
            self.chunks.remove(key);
        }
        if self.meta.get(key).is_some_and(|e| !e.live(now)) {
            self.meta.remove(key);
        }
        if self.merged.get(key).is_some_and(|e| !e.live(now)) {
            self.merged.remove(key);
        }
    }
}

/// Session store for tests/dev. All state lives behind one lock, so every
/// operation is atomic.
#[derive(Debug)]
pub struct InMemorySessionStore {
    clock: Arc<dyn Clock>,
    sessions: RwLock<Sessions>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: RwLock::new(Sessions::default()),
        }
    }

    fn live<R>(&self, key: &SessionKey, read: impl FnOnce(&Sessions) -> R) -> R {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.expire(key, now);
        read(&sessions)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn write_chunk(
        &self,
        key: &SessionKey,
        index: u32,
        bytes: Vec<u8>,
        total: u32,
        ttl: Duration,
    ) -> Result<ChunkWrite, SessionStoreError> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(ttl);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.expire(key, now);

        if let Some(meta) = sessions.meta.get(key) {
            if meta.value.total_chunks != total {
                return Ok(ChunkWrite::TotalMismatch {
                    recorded: meta.value.total_chunks,
                });
            }
        }

        let chunks = sessions.chunks.entry(key.clone()).or_insert_with(|| Expiring {
            value: BTreeMap::new(),
            expires_at,
        });
        let newly_inserted = chunks.value.insert(index, bytes).is_none();
        chunks.expires_at = expires_at;
        let uploaded = u32::try_from(chunks.value.len()).unwrap_or(u32::MAX);

        sessions.meta.insert(
            key.clone(),
            Expiring {
                value: SessionMeta {
                    total_chunks: total,
                    last_updated: now,
                },
                expires_at,
            },
        );

        Ok(ChunkWrite::Stored {
            newly_inserted,
            uploaded,
            total,
        })
    }

    async fn meta(&self, key: &SessionKey) -> Result<Option<SessionMeta>, SessionStoreError> {
        Ok(self.live(key, |s| s.meta.get(key).map(|e| e.value)))
    }

    async fn chunk_count(&self, key: &SessionKey) -> Result<u32, SessionStoreError> {
        Ok(self.live(key, |s| {
            s.chunks
                .get(key)
                .map_or(0, |e| u32::try_from(e.value.len()).unwrap_or(u32::MAX))
        }))
    }

    async fn chunk_indices(&self, key: &SessionKey) -> Result<Vec<u32>, SessionStoreError> {
        Ok(self.live(key, |s| {
            s.chunks
                .get(key)
                .map(|e| e.value.keys().copied().collect())
                .unwrap_or_default()
        }))
    }

    async fn read_chunks(
        &self,
        key: &SessionKey,
    ) -> Result<BTreeMap<u32, Vec<u8>>, SessionStoreError> {
        Ok(self.live(key, |s| {
            s.chunks.get(key).map(|e| e.value.clone()).unwrap_or_default()
        }))
    }

    async fn write_merged(
        &self,
        key: &SessionKey,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), SessionStoreError> {
        let expires_at = self.clock.now() + to_chrono(ttl);
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merged
            .insert(
                key.clone(),
                Expiring {
                    value: bytes,
                    expires_at,
                },
            );
        Ok(())
    }

    async fn read_merged(&self, key: &SessionKey) -> Result<Option<Vec<u8>>, SessionStoreError> {
        Ok(self.live(key, |s| s.merged.get(key).map(|e| e.value.clone())))
    }

    async fn has_merged(&self, key: &SessionKey) -> Result<bool, SessionStoreError> {
        Ok(self.live(key, |s| s.merged.contains_key(key)))
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.chunks.remove(key);
        sessions.meta.remove(key);
        sessions.merged.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), SessionStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::{ManualClock, UploadId, UploadKind};

    const TTL: Duration = Duration::from_secs(1800);

    fn key() -> SessionKey {
        SessionKey::new(UploadId::parse("up-1").unwrap(), UploadKind::Media)
    }

    #[tokio::test]
    async fn first_write_fixes_total_and_rewrites_are_not_new() {
        let store = InMemorySessionStore::new();
        let key = key();

        let first = store.write_chunk(&key, 0, vec![1], 2, TTL).await.unwrap();
        let again = store.write_chunk(&key, 0, vec![1], 2, TTL).await.unwrap();
        let mismatch = store.write_chunk(&key, 1, vec![2], 5, TTL).await.unwrap();

        assert_eq!(
            first,
            ChunkWrite::Stored {
                newly_inserted: true,
                uploaded: 1,
                total: 2
            }
        );
        assert_eq!(
            again,
            ChunkWrite::Stored {
                newly_inserted: false,
                uploaded: 1,
                total: 2
            }
        );
        assert_eq!(mismatch, ChunkWrite::TotalMismatch { recorded: 2 });
        assert_eq!(store.chunk_indices(&key).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn writes_refresh_the_ttl_window() {
        let clock = ManualClock::default();
        let store = InMemorySessionStore::with_clock(Arc::new(clock.clone()));
        let key = key();

        store.write_chunk(&key, 0, vec![1], 3, TTL).await.unwrap();
        clock.advance(Duration::from_secs(1500));
        store.write_chunk(&key, 1, vec![2], 3, TTL).await.unwrap();
        clock.advance(Duration::from_secs(1500));

        assert_eq!(store.chunk_count(&key).await.unwrap(), 2);

        clock.advance(Duration::from_secs(301));
        assert_eq!(store.chunk_count(&key).await.unwrap(), 0);
        assert!(store.meta(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merged_blob_expires_and_delete_clears_everything() {
        let clock = ManualClock::default();
        let store = InMemorySessionStore::with_clock(Arc::new(clock.clone()));
        let key = key();

        store.write_chunk(&key, 0, vec![1], 1, TTL).await.unwrap();
        store.write_merged(&key, vec![1], TTL).await.unwrap();
        assert!(store.has_merged(&key).await.unwrap());

        store.delete(&key).await.unwrap();
        assert!(!store.has_merged(&key).await.unwrap());
        assert!(store.meta(&key).await.unwrap().is_none());

        store.write_merged(&key, vec![9], TTL).await.unwrap();
        clock.advance(TTL);
        assert_eq!(store.read_merged(&key).await.unwrap(), None);
    }
}
