use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use ingest_core::{ChunkStatus, Progress, SavedUpload, UploadId, UploadKind};

use super::{MERGE_TOPIC, MergeRequest, UploadError};
use crate::files::FileStore;
use crate::jobs::{JobStore, QueueError};
use crate::session::{ChunkWrite, SessionKey, SessionStore};

#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Rolling TTL of every session key, refreshed on each write.
    pub ttl: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Accumulates upload chunks, merges complete sessions and saves the result.
pub struct ChunkReassembler {
    sessions: Arc<dyn SessionStore>,
    merge_queue: Arc<dyn JobStore>,
    files: Arc<dyn FileStore>,
    config: ReassemblerConfig,
}

impl ChunkReassembler {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        merge_queue: Arc<dyn JobStore>,
        files: Arc<dyn FileStore>,
        config: ReassemblerConfig,
    ) -> Self {
        Self {
            sessions,
            merge_queue,
            files,
            config,
        }
    }

    /// Store chunk `index` of `total`.
    ///
    /// The write that newly inserts the last missing chunk enqueues exactly one
    /// merge job; retransmissions and concurrent writers never do.
    pub async fn store_chunk(
        &self,
        upload_id: &UploadId,
        kind: UploadKind,
        index: u32,
        bytes: Vec<u8>,
        total: u32,
    ) -> Result<Progress, UploadError> {
        if total == 0 {
            return Err(UploadError::InvalidChunk(
                "total_chunks must be at least 1".to_string(),
            ));
        }
        if index >= total {
            return Err(UploadError::InvalidChunk(format!(
                "chunk index {index} out of range for {total} chunks"
            )));
        }

        let key = SessionKey::new(upload_id.clone(), kind);
        let write = self
            .sessions
            .write_chunk(&key, index, bytes, total, self.config.ttl)
            .await?;

        let (newly_inserted, uploaded) = match write {
            ChunkWrite::Stored {
                newly_inserted,
                uploaded,
                ..
            } => (newly_inserted, uploaded),
            ChunkWrite::TotalMismatch { recorded } => {
                return Err(UploadError::InvalidChunk(format!(
                    "total_chunks {total} does not match {recorded} recorded for this upload"
                )));
            }
        };

        if newly_inserted && uploaded == total {
            let request = MergeRequest {
                upload_id: upload_id.clone(),
                kind,
            };
            let payload = serde_json::to_string(&request)
                .map_err(|e| QueueError::Backend(format!("encode merge request: {e}")))?;
            let job_id = self.merge_queue.enqueue(MERGE_TOPIC, payload).await?;
            info!(
                upload_id = %upload_id,
                kind = ?kind,
                total,
                job_id = %job_id,
                "all chunks received, merge enqueued"
            );
        }

        Ok(Progress::new(uploaded, total))
    }

    /// Concatenate chunks `0..total` into the merged blob.
    ///
    /// Fails with `Incomplete` (writing nothing) while any chunk is missing.
    /// Chunks are left in place, so repeated merges produce the same bytes.
    pub async fn merge_chunks(
        &self,
        upload_id: &UploadId,
        kind: UploadKind,
    ) -> Result<Vec<u8>, UploadError> {
        let key = SessionKey::new(upload_id.clone(), kind);
        let meta = self
            .sessions
            .meta(&key)
            .await?
            .ok_or_else(|| UploadError::Expired(upload_id.clone()))?;
        let total = meta.total_chunks;

        let chunks = self.sessions.read_chunks(&key).await?;
        let missing: Vec<u32> = (0..total).filter(|i| !chunks.contains_key(i)).collect();
        if !missing.is_empty() {
            return Err(UploadError::Incomplete {
                upload_id: upload_id.clone(),
                missing,
                total,
            });
        }

        let merged: Vec<u8> = (0..total)
            .filter_map(|i| chunks.get(&i))
            .flat_map(|chunk| chunk.iter().copied())
            .collect();

        self.sessions
            .write_merged(&key, merged.clone(), self.config.ttl)
            .await?;
        info!(upload_id = %upload_id, kind = ?kind, bytes = merged.len(), "chunks merged");
        Ok(merged)
    }

    /// `{uploaded, total}`; `{0, 0}` once the session has expired.
    pub async fn get_progress(
        &self,
        upload_id: &UploadId,
        kind: UploadKind,
    ) -> Result<Progress, UploadError> {
        let key = SessionKey::new(upload_id.clone(), kind);
        let Some(meta) = self.sessions.meta(&key).await? else {
            return Ok(Progress::default());
        };
        let uploaded = self.sessions.chunk_count(&key).await?;
        Ok(Progress::new(uploaded, meta.total_chunks))
    }

    pub async fn check_status(
        &self,
        upload_id: &UploadId,
        kind: UploadKind,
    ) -> Result<ChunkStatus, UploadError> {
        let key = SessionKey::new(upload_id.clone(), kind);
        let total = self
            .sessions
            .meta(&key)
            .await?
            .map_or(0, |m| m.total_chunks);
        let chunks = self.sessions.chunk_indices(&key).await?;
        let merged = self.sessions.has_merged(&key).await?;
        let is_complete = total > 0 && chunks.len() == total as usize;

        Ok(ChunkStatus {
            upload_id: upload_id.clone(),
            kind,
            chunks,
            total,
            is_complete,
            merged,
        })
    }

    /// Write the merged media (and cover, if any) to the file store and
    /// delete every session key of `upload_id`.
    ///
    /// Media is required. A complete but not yet merged session is merged
    /// inline; a partial one fails with `Incomplete`, an absent one with
    /// `Expired`. A cover that cannot be assembled is skipped.
    pub async fn confirm_and_save(&self, upload_id: &UploadId) -> Result<SavedUpload, UploadError> {
        let media = self
            .assembled(upload_id, UploadKind::Media)
            .await?
            .ok_or_else(|| UploadError::Expired(upload_id.clone()))?;

        let cover = match self.assembled(upload_id, UploadKind::Cover).await {
            Ok(cover) => cover,
            Err(err @ UploadError::Incomplete { .. }) => {
                warn!(upload_id = %upload_id, error = %err, "cover incomplete, saving media only");
                None
            }
            Err(err) => return Err(err),
        };

        let media_path = self.save(upload_id, UploadKind::Media, &media).await?;
        let cover_path = match cover {
            Some(bytes) => Some(self.save(upload_id, UploadKind::Cover, &bytes).await?),
            None => None,
        };

        for kind in UploadKind::ALL {
            self.sessions
                .delete(&SessionKey::new(upload_id.clone(), kind))
                .await?;
        }

        info!(upload_id = %upload_id, media = %media_path, cover = ?cover_path, "upload saved");
        Ok(SavedUpload {
            upload_id: upload_id.clone(),
            media_path,
            cover_path,
        })
    }

    /// Merged bytes for one kind, merging on the fly when needed. `None` when
    /// no session exists.
    async fn assembled(
        &self,
        upload_id: &UploadId,
        kind: UploadKind,
    ) -> Result<Option<Vec<u8>>, UploadError> {
        let key = SessionKey::new(upload_id.clone(), kind);
        if let Some(bytes) = self.sessions.read_merged(&key).await? {
            return Ok(Some(bytes));
        }
        if self.sessions.meta(&key).await?.is_none() {
            return Ok(None);
        }
        self.merge_chunks(upload_id, kind).await.map(Some)
    }

    async fn save(
        &self,
        upload_id: &UploadId,
        kind: UploadKind,
        bytes: &[u8],
    ) -> Result<String, UploadError> {
        let relative = kind.relative_path(upload_id);
        self.files.write(&relative, bytes).await?;
        Ok(format!("/{relative}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::LocalFileStore;
    use crate::jobs::InMemoryJobStore;
    use crate::session::InMemorySessionStore;
    use ingest_core::ManualClock;
    use proptest::prelude::*;

    struct Harness {
        reassembler: ChunkReassembler,
        queue: Arc<InMemoryJobStore>,
        clock: ManualClock,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let clock = ManualClock::default();
        let shared: Arc<dyn ingest_core::Clock> = Arc::new(clock.clone());
        let queue = Arc::new(InMemoryJobStore::with_clock("file-merge", shared.clone()));
        let dir = tempfile::tempdir().unwrap();
        let reassembler = ChunkReassembler::new(
            Arc::new(InMemorySessionStore::with_clock(shared)),
            queue.clone(),
            Arc::new(LocalFileStore::new(dir.path())),
            ReassemblerConfig::default(),
        );
        Harness {
            reassembler,
            queue,
            clock,
            dir,
        }
    }

    fn id(raw: &str) -> UploadId {
        UploadId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn three_chunk_upload_enqueues_one_merge_and_concatenates_in_order() {
        let h = harness();
        let up = id("song-1");

        // Out of order, with a retransmission after completion.
        h.reassembler.store_chunk(&up, UploadKind::Media, 2, b"ccc".to_vec(), 3).await.unwrap();
        h.reassembler.store_chunk(&up, UploadKind::Media, 0, b"a".to_vec(), 3).await.unwrap();
        let progress = h.reassembler.store_chunk(&up, UploadKind::Media, 1, b"bb".to_vec(), 3).await.unwrap();
        h.reassembler.store_chunk(&up, UploadKind::Media, 1, b"bb".to_vec(), 3).await.unwrap();

        assert_eq!(progress, Progress::new(3, 3));
        assert_eq!(
            h.reassembler.get_progress(&up, UploadKind::Media).await.unwrap(),
            Progress::new(3, 3)
        );

        let jobs = h.queue.snapshot();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].topic, MERGE_TOPIC);
        let request: MergeRequest = serde_json::from_str(&jobs[0].payload).unwrap();
        assert_eq!(request, MergeRequest { upload_id: up.clone(), kind: UploadKind::Media });

        let merged = h.reassembler.merge_chunks(&up, UploadKind::Media).await.unwrap();
        assert_eq!(merged, b"abbccc");
    }

    #[tokio::test]
    async fn merge_with_gap_is_incomplete_and_writes_nothing() {
        let h = harness();
        let up = id("gap");
        h.reassembler.store_chunk(&up, UploadKind::Media, 0, b"a".to_vec(), 3).await.unwrap();
        h.reassembler.store_chunk(&up, UploadKind::Media, 2, b"c".to_vec(), 3).await.unwrap();

        let err = h.reassembler.merge_chunks(&up, UploadKind::Media).await.unwrap_err();

        assert!(matches!(err, UploadError::Incomplete { ref missing, total: 3, .. } if missing == &vec![1]));
        let status = h.reassembler.check_status(&up, UploadKind::Media).await.unwrap();
        assert_eq!(status.chunks, vec![0, 2]);
        assert!(!status.is_complete);
        assert!(!status.merged);
    }

    #[tokio::test]
    async fn rejects_bad_indices_and_total_changes() {
        let h = harness();
        let up = id("bad");

        for (index, total) in [(0, 0), (3, 3)] {
            let err = h.reassembler.store_chunk(&up, UploadKind::Media, index, vec![1], total).await;
            assert!(matches!(err, Err(UploadError::InvalidChunk(_))));
        }

        h.reassembler.store_chunk(&up, UploadKind::Media, 0, vec![1], 3).await.unwrap();
        let err = h.reassembler.store_chunk(&up, UploadKind::Media, 1, vec![2], 4).await;
        assert!(matches!(err, Err(UploadError::InvalidChunk(_))));
        assert_eq!(
            h.reassembler.get_progress(&up, UploadKind::Media).await.unwrap(),
            Progress::new(1, 3)
        );
    }

    #[tokio::test]
    async fn stalled_upload_expires() {
        let h = harness();
        let up = id("stall");
        h.reassembler.store_chunk(&up, UploadKind::Media, 0, b"a".to_vec(), 3).await.unwrap();

        h.clock.advance(Duration::from_secs(31 * 60));

        assert_eq!(
            h.reassembler.get_progress(&up, UploadKind::Media).await.unwrap(),
            Progress::new(0, 0)
        );
        let err = h.reassembler.confirm_and_save(&up).await.unwrap_err();
        assert!(matches!(err, UploadError::Expired(_)));
    }

    #[tokio::test]
    async fn confirm_refuses_partial_uploads() {
        let h = harness();
        let up = id("partial");
        h.reassembler.store_chunk(&up, UploadKind::Media, 0, b"a".to_vec(), 2).await.unwrap();

        let err = h.reassembler.confirm_and_save(&up).await.unwrap_err();

        assert!(matches!(err, UploadError::Incomplete { .. }));
        assert!(!h.dir.path().join("music_files").exists());
    }

    #[tokio::test]
    async fn confirm_saves_media_and_cover_then_clears_session() {
        let h = harness();
        let up = id("album-7");
        h.reassembler.store_chunk(&up, UploadKind::Media, 0, b"mp".to_vec(), 2).await.unwrap();
        h.reassembler.store_chunk(&up, UploadKind::Media, 1, b"3!".to_vec(), 2).await.unwrap();
        h.reassembler.merge_chunks(&up, UploadKind::Media).await.unwrap();
        // Cover complete but never merged: merged during confirm.
        h.reassembler.store_chunk(&up, UploadKind::Cover, 0, b"jpg".to_vec(), 1).await.unwrap();

        let saved = h.reassembler.confirm_and_save(&up).await.unwrap();

        assert_eq!(saved.media_path, "/music_files/album-7/album-7.mp3");
        assert_eq!(saved.cover_path.as_deref(), Some("/cover_files/album-7/album-7.jpg"));
        assert_eq!(
            std::fs::read(h.dir.path().join("music_files/album-7/album-7.mp3")).unwrap(),
            b"mp3!"
        );
        assert_eq!(
            std::fs::read(h.dir.path().join("cover_files/album-7/album-7.jpg")).unwrap(),
            b"jpg"
        );
        for kind in UploadKind::ALL {
            assert_eq!(h.reassembler.get_progress(&up, kind).await.unwrap(), Progress::default());
        }
        assert!(matches!(
            h.reassembler.confirm_and_save(&up).await,
            Err(UploadError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn merged_blob_outlives_expired_chunks_until_its_own_ttl() {
        let h = harness();
        let up = id("late");
        h.reassembler.store_chunk(&up, UploadKind::Media, 0, b"x".to_vec(), 1).await.unwrap();
        h.clock.advance(Duration::from_secs(20 * 60));
        h.reassembler.merge_chunks(&up, UploadKind::Media).await.unwrap();
        h.clock.advance(Duration::from_secs(20 * 60));

        let saved = h.reassembler.confirm_and_save(&up).await.unwrap();
        assert_eq!(saved.cover_path, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_final_chunks_enqueue_exactly_one_merge() {
        for round in 0..50 {
            let Harness {
                reassembler,
                queue,
                dir: _dir,
                ..
            } = harness();
            let reassembler = Arc::new(reassembler);
            let up = id(&format!("race-{round}"));

            // Every index written twice, all at once.
            let mut writers = tokio::task::JoinSet::new();
            for index in 0..4u32 {
                for _ in 0..2 {
                    let reassembler = reassembler.clone();
                    let up = up.clone();
                    writers.spawn(async move {
                        reassembler
                            .store_chunk(&up, UploadKind::Media, index, vec![index as u8], 4)
                            .await
                    });
                }
            }
            while let Some(written) = writers.join_next().await {
                written.unwrap().unwrap();
            }

            let merges = queue.snapshot();
            assert_eq!(merges.len(), 1, "round {round}: {merges:?}");
            assert_eq!(merges[0].topic, MERGE_TOPIC);
        }
    }

    proptest! {
        #[test]
        fn merge_is_idempotent_and_ordered(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 1..8),
            seed in any::<u64>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let h = harness();
                let up = id("prop");
                let total = chunks.len() as u32;

                // Deterministic shuffle of the upload order.
                let mut order: Vec<u32> = (0..total).collect();
                order.sort_by_key(|i| (u64::from(*i) ^ seed).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                for i in order {
                    h.reassembler
                        .store_chunk(&up, UploadKind::Media, i, chunks[i as usize].clone(), total)
                        .await
                        .unwrap();
                }

                let first = h.reassembler.merge_chunks(&up, UploadKind::Media).await.unwrap();
                let second = h.reassembler.merge_chunks(&up, UploadKind::Media).await.unwrap();

                prop_assert_eq!(&first, &chunks.concat());
                prop_assert_eq!(first, second);
                prop_assert_eq!(h.queue.snapshot().len(), 1);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
