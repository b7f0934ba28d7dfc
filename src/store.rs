//! Persistent vector index store.
//!
//! [`VectorIndexStore`] wraps the in-memory [`MemoryIndex`] with snapshot
//! persistence. Writes are serialized by a store-level guard; when
//! `persist_on_write` is set each write is saved before it returns, and a
//! failed save undoes the in-memory change so callers never see a write
//! reported as failed but still searchable. Snapshot file I/O runs on the
//! blocking pool.
//!
//! # Loading
//!
//! [`VectorIndexStore::open`] never fails:
//!
//! 1. No snapshot → fresh empty index.
//! 2. Vector section unreadable, or built for a different dimension →
//!    empty index (the loss is logged).
//! 3. Vector section fine but metadata corrupt → salvage: the vector structure
//!    is kept and every slot becomes an ownerless tombstone, i.e. metadata
//!    is reset to empty.
//! 4. Both readable → restored as saved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use specter_rag_core::index::memory::{MemoryIndex, Slot};
use specter_rag_core::index::{IndexResult, IndexWriteError, Metric, SearchHit, VectorIndex};
use specter_rag_core::models::DocumentChunk;

use crate::config::IndexConfig;
use crate::snapshot;
use crate::TRACING_TARGET;

/// What happened when the store was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No path configured, or no snapshot on disk yet.
    Fresh,
    /// Snapshot restored intact.
    Restored { slots: usize },
    /// Metadata was corrupt; vectors were kept as ownerless tombstones.
    Salvaged { orphaned: usize, reason: String },
    /// Nothing usable on disk; started empty.
    Reset { reason: String },
}

/// The shared index used by every conversation, optionally persisted.
pub struct VectorIndexStore {
    index: MemoryIndex,
    path: Option<PathBuf>,
    persist_on_write: bool,
    write_guard: Mutex<()>,
    load_outcome: LoadOutcome,
}

impl VectorIndexStore {
    /// Memory-only store.
    pub fn in_memory(dims: usize, metric: Metric) -> Self {
        Self {
            index: MemoryIndex::new(dims, metric),
            path: None,
            persist_on_write: false,
            write_guard: Mutex::new(()),
            load_outcome: LoadOutcome::Fresh,
        }
    }

    /// Open the store described by `config` for vectors of `dims`.
    pub fn from_config(config: &IndexConfig, dims: usize) -> Self {
        match &config.path {
            Some(path) => Self::open(path, dims, config.metric, config.persist_on_write),
            None => Self::in_memory(dims, config.metric),
        }
    }

    /// Load (or salvage, or reset) the snapshot at `dir`.
    pub fn open(dir: &Path, dims: usize, metric: Metric, persist_on_write: bool) -> Self {
        let (index, load_outcome) = load(dir, dims, metric);
        match &load_outcome {
            LoadOutcome::Fresh => {
                tracing::info!(target: TRACING_TARGET, path = %dir.display(), "starting new vector index")
            }
            LoadOutcome::Restored { slots } => tracing::info!(
                target: TRACING_TARGET,
                path = %dir.display(),
                slots,
                live = index.live_count(),
                "vector index restored"
            ),
            LoadOutcome::Salvaged { orphaned, reason } => tracing::warn!(
                target: TRACING_TARGET,
                path = %dir.display(),
                orphaned,
                %reason,
                "index metadata corrupt; salvaged vectors, chunk metadata lost"
            ),
            LoadOutcome::Reset { reason } => tracing::warn!(
                target: TRACING_TARGET,
                path = %dir.display(),
                %reason,
                "index snapshot unusable; starting with an empty index"
            ),
        }
        Self {
            index,
            path: Some(dir.to_path_buf()),
            persist_on_write,
            write_guard: Mutex::new(()),
            load_outcome,
        }
    }

    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.load_outcome
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total slots, tombstones included.
    pub fn slot_count(&self) -> usize {
        self.index.slot_count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.index.tombstone_count()
    }

    /// Write the snapshot now. A no-op for memory-only stores.
    pub async fn save(&self) -> IndexResult<()> {
        let _guard = self.lock_writes().await;
        self.save_locked().await
    }

    /// Drop tombstones and, if persistent, save. Returns slots reclaimed.
    pub async fn compact(&self) -> IndexResult<usize> {
        let _guard = self.lock_writes().await;
        let reclaimed = self.index.compact();
        self.save_locked().await?;
        Ok(reclaimed)
    }

    async fn save_locked(&self) -> IndexResult<()> {
        let Some(dir) = self.path.clone() else {
            return Ok(());
        };
        let slots = self.index.export_slots();
        let count = slots.len();
        let (dims, metric) = (self.index.dims(), self.index.metric());
        let target = dir.clone();
        tokio::task::spawn_blocking(move || snapshot::write(&target, dims, metric, &slots))
            .await
            .map_err(|e| IndexWriteError::storage(e.to_string()))?
            .map_err(|e| IndexWriteError::storage(e.to_string()))?;
        tracing::debug!(target: TRACING_TARGET, path = %dir.display(), slots = count, "index snapshot saved");
        Ok(())
    }

    async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_guard.lock().await
    }

    /// Persist after a successful in-memory write, undoing it on failure.
    async fn commit<T>(&self, undo: Undo, value: T) -> IndexResult<T> {
        if !self.persist_on_write {
            return Ok(value);
        }
        if let Err(e) = self.save_locked().await {
            tracing::warn!(target: TRACING_TARGET, error = %e, "index write not persisted; rolled back");
            match undo {
                Undo::Truncate(len) => self.index.truncate(len),
                Undo::Restore(positions) => self.index.restore(&positions),
                Undo::Demote(positions) => self.index.demote(&positions),
            }
            return Err(e);
        }
        Ok(value)
    }
}

/// Inverse of one in-memory write.
enum Undo {
    Truncate(usize),
    Restore(Vec<usize>),
    Demote(Vec<usize>),
}

#[async_trait]
impl VectorIndex for VectorIndexStore {
    fn dims(&self) -> usize {
        self.index.dims()
    }

    fn metric(&self) -> Metric {
        self.index.metric()
    }

    async fn add(&self, chunk: DocumentChunk) -> IndexResult<()> {
        self.add_batch(vec![chunk]).await.map(|_| ())
    }

    async fn add_batch(&self, chunks: Vec<DocumentChunk>) -> IndexResult<usize> {
        let _guard = self.lock_writes().await;
        let len = self.index.slot_count();
        let added = self.index.append(chunks)?;
        self.commit(Undo::Truncate(len), added).await
    }

    async fn search(&self, vector: &[f32], k: usize) -> Vec<SearchHit> {
        self.index.search(vector, k).await
    }

    async fn chunk(&self, chunk_id: &str) -> Option<DocumentChunk> {
        self.index.chunk(chunk_id).await
    }

    async fn remove_by_conversation(&self, conversation_id: &str) -> IndexResult<usize> {
        let _guard = self.lock_writes().await;
        let removed = self.index.tombstone_owned(conversation_id, None);
        if removed.is_empty() {
            return Ok(0);
        }
        let count = removed.len();
        self.commit(Undo::Restore(removed), count).await
    }

    async fn remove_file(&self, conversation_id: &str, source_filename: &str) -> IndexResult<usize> {
        let _guard = self.lock_writes().await;
        let removed = self.index.tombstone_owned(conversation_id, Some(source_filename));
        if removed.is_empty() {
            return Ok(0);
        }
        let count = removed.len();
        self.commit(Undo::Restore(removed), count).await
    }

    async fn assign_conversation(&self, pending_id: &str, conversation_id: &str) -> IndexResult<usize> {
        let _guard = self.lock_writes().await;
        let moved = self.index.promote(pending_id, conversation_id);
        if moved.is_empty() {
            return Ok(0);
        }
        let count = moved.len();
        self.commit(Undo::Demote(moved), count).await
    }

    async fn total_count(&self) -> usize {
        self.index.total_count().await
    }

    async fn owner_counts(&self) -> HashMap<String, usize> {
        self.index.owner_counts().await
    }
}

fn load(dir: &Path, dims: usize, metric: Metric) -> (MemoryIndex, LoadOutcome) {
    let empty = || MemoryIndex::new(dims, metric);

    if !snapshot::exists(dir) {
        return (empty(), LoadOutcome::Fresh);
    }

    let file = match snapshot::read(dir) {
        Ok(file) => file,
        Err(e) => {
            return (empty(), LoadOutcome::Reset { reason: e.to_string() });
        }
    };
    if file.dims != dims {
        let reason = format!(
            "snapshot holds {}-dimensional vectors but the embedder produces {}",
            file.dims, dims
        );
        return (empty(), LoadOutcome::Reset { reason });
    }

    match file.slots() {
        Ok((saved_metric, slots)) => {
            if saved_metric != metric {
                tracing::warn!(
                    target: TRACING_TARGET,
                    saved = %saved_metric,
                    configured = %metric,
                    "snapshot was built with a different metric; using the configured one"
                );
            }
            let count = slots.len();
            (
                MemoryIndex::from_slots(dims, metric, slots),
                LoadOutcome::Restored { slots: count },
            )
        }
        Err(e) => {
            let orphaned = file.vectors.len();
            let slots = salvage(file.vectors);
            (
                MemoryIndex::from_slots(dims, metric, slots),
                LoadOutcome::Salvaged {
                    orphaned,
                    reason: e.to_string(),
                },
            )
        }
    }
}

/// Keep the vector structure, drop all metadata. Every slot becomes an
/// ownerless tombstone, invisible to every conversation.
fn salvage(vectors: Vec<Vec<f32>>) -> Vec<Slot> {
    let now = Utc::now();
    vectors
        .into_iter()
        .map(|vector| Slot {
            chunk: DocumentChunk {
                chunk_id: Uuid::new_v4().to_string(),
                vector,
                text: String::new(),
                conversation_id: None,
                pending_conversation_id: None,
                source_filename: String::new(),
                upload_timestamp: now,
            },
            deleted: true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use specter_rag_core::models::ChunkOwner;
    use std::fs;
    use tempfile::TempDir;

    fn chunk(owner: &str, vector: Vec<f32>) -> DocumentChunk {
        DocumentChunk::new(&ChunkOwner::Conversation(owner.to_string()), "doc.txt", "hello", vector)
    }

    fn truncate_tail(dir: &Path, n: usize) {
        let path = snapshot::path(dir);
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - n);
        fs::write(&path, bytes).unwrap();
    }

    /// A persisting store whose snapshot directory cannot be created.
    fn unwritable(tmp: &TempDir, index: MemoryIndex) -> VectorIndexStore {
        let blocker = tmp.path().join("blocked");
        fs::write(&blocker, b"").unwrap();
        VectorIndexStore {
            index,
            path: Some(blocker.join("index")),
            persist_on_write: true,
            write_guard: Mutex::new(()),
            load_outcome: LoadOutcome::Fresh,
        }
    }

    #[tokio::test]
    async fn test_fresh_then_restored() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");

        let store = VectorIndexStore::open(&dir, 2, Metric::Cosine, true);
        assert_eq!(store.load_outcome(), &LoadOutcome::Fresh);
        store.add(chunk("A", vec![1.0, 0.0])).await.unwrap();
        store.add(chunk("B", vec![0.0, 1.0])).await.unwrap();
        store.remove_by_conversation("B").await.unwrap();
        drop(store);

        let reopened = VectorIndexStore::open(&dir, 2, Metric::Cosine, true);
        assert_eq!(reopened.load_outcome(), &LoadOutcome::Restored { slots: 2 });
        assert_eq!(reopened.total_count().await, 1);
        assert_eq!(reopened.tombstone_count(), 1);
        let hits = reopened.search(&[1.0, 0.0], 5).await;
        assert_eq!(hits.len(), 1);
        let found = reopened.chunk(&hits[0].chunk_id).await.unwrap();
        assert_eq!(found.conversation_id.as_deref(), Some("A"));
        assert_eq!(found.vector, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_salvaged() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::open(tmp.path(), 2, Metric::Cosine, true);
        store.add(chunk("A", vec![1.0, 0.0])).await.unwrap();
        store.add(chunk("A", vec![0.5, 0.5])).await.unwrap();
        drop(store);

        truncate_tail(tmp.path(), 5);

        let salvaged = VectorIndexStore::open(tmp.path(), 2, Metric::Cosine, true);
        assert!(matches!(salvaged.load_outcome(), LoadOutcome::Salvaged { orphaned: 2, .. }));
        assert_eq!(salvaged.slot_count(), 2);
        assert_eq!(salvaged.total_count().await, 0);
        assert!(salvaged.search(&[1.0, 0.0], 5).await.is_empty());
        assert!(salvaged.owner_counts().await.is_empty());

        salvaged.add(chunk("C", vec![1.0, 0.0])).await.unwrap();
        assert_eq!(salvaged.total_count().await, 1);
    }

    #[tokio::test]
    async fn test_corrupt_vectors_reset_to_empty() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::open(tmp.path(), 2, Metric::Cosine, true);
        store.add(chunk("A", vec![1.0, 0.0])).await.unwrap();
        drop(store);

        fs::write(snapshot::path(tmp.path()), b"\x00\x01").unwrap();

        let reset = VectorIndexStore::open(tmp.path(), 2, Metric::Cosine, true);
        assert!(matches!(reset.load_outcome(), LoadOutcome::Reset { .. }));
        assert_eq!(reset.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_dimension_change_resets() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::open(tmp.path(), 2, Metric::Cosine, true);
        store.add(chunk("A", vec![1.0, 0.0])).await.unwrap();
        drop(store);

        let reopened = VectorIndexStore::open(tmp.path(), 3, Metric::Cosine, true);
        assert!(matches!(reopened.load_outcome(), LoadOutcome::Reset { .. }));
        assert_eq!(reopened.dims(), 3);
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back_add() {
        let tmp = TempDir::new().unwrap();
        let store = unwritable(&tmp, MemoryIndex::new(1, Metric::Cosine));
        let err = store.add(chunk("A", vec![1.0])).await.unwrap_err();
        assert!(matches!(err, IndexWriteError::Storage(_)));
        assert_eq!(store.total_count().await, 0);
        assert_eq!(store.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_persist_undoes_only_the_failed_write() {
        let tmp = TempDir::new().unwrap();
        let index = MemoryIndex::new(1, Metric::Cosine);
        index.append(vec![chunk("A", vec![1.0])]).unwrap();
        let mut pending = chunk("A", vec![1.0]);
        pending.conversation_id = None;
        pending.pending_conversation_id = Some("P".to_string());
        index.append(vec![pending]).unwrap();
        let store = unwritable(&tmp, index);

        let batch = vec![chunk("B", vec![1.0]), chunk("B", vec![1.0])];
        assert!(store.add_batch(batch).await.is_err());
        assert_eq!(store.slot_count(), 2);
        assert_eq!(store.owner_counts().await.get("B"), None);

        assert!(store.remove_by_conversation("A").await.is_err());
        assert_eq!(store.total_count().await, 2);
        assert_eq!(store.tombstone_count(), 0);

        assert!(store.assign_conversation("P", "C").await.is_err());
        let counts = store.owner_counts().await;
        assert_eq!(counts.get("P"), Some(&1));
        assert_eq!(counts.get("C"), None);
    }

    #[tokio::test]
    async fn test_batch_saves_once_and_restores() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::open(tmp.path(), 1, Metric::Cosine, true);
        let batch: Vec<DocumentChunk> = (0..3).map(|_| chunk("A", vec![1.0])).collect();
        assert_eq!(store.add_batch(batch).await.unwrap(), 3);
        drop(store);

        let reopened = VectorIndexStore::open(tmp.path(), 1, Metric::Cosine, true);
        assert_eq!(reopened.load_outcome(), &LoadOutcome::Restored { slots: 3 });
        assert_eq!(reopened.owner_counts().await.get("A"), Some(&3));
    }

    #[tokio::test]
    async fn test_interrupted_save_keeps_previous_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::open(tmp.path(), 2, Metric::Cosine, true);
        store.add(chunk("A", vec![1.0, 0.0])).await.unwrap();
        store.add(chunk("B", vec![0.0, 1.0])).await.unwrap();
        let saved = fs::read(snapshot::path(tmp.path())).unwrap();
        store.add(chunk("A", vec![0.5, 0.5])).await.unwrap();
        drop(store);

        // The rename never happened: the old snapshot is still in place and
        // a partly written temp file sits beside it.
        fs::write(snapshot::path(tmp.path()), &saved).unwrap();
        fs::write(tmp.path().join("index.tmp"), &saved[..saved.len() / 2]).unwrap();

        let reopened = VectorIndexStore::open(tmp.path(), 2, Metric::Cosine, true);
        assert_eq!(reopened.load_outcome(), &LoadOutcome::Restored { slots: 2 });
        let counts = reopened.owner_counts().await;
        assert_eq!(counts.get("A"), Some(&1));
        assert_eq!(counts.get("B"), Some(&1));
    }

    #[tokio::test]
    async fn test_compact_persists() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::open(tmp.path(), 1, Metric::Cosine, false);
        store.add(chunk("A", vec![1.0])).await.unwrap();
        store.add(chunk("B", vec![1.0])).await.unwrap();
        store.remove_by_conversation("A").await.unwrap();
        assert!(!snapshot::exists(tmp.path()));

        assert_eq!(store.compact().await.unwrap(), 1);
        let reopened = VectorIndexStore::open(tmp.path(), 1, Metric::Cosine, false);
        assert_eq!(reopened.load_outcome(), &LoadOutcome::Restored { slots: 1 });
    }

    #[tokio::test]
    async fn test_in_memory_never_touches_disk() {
        let store = VectorIndexStore::in_memory(1, Metric::InnerProduct);
        store.add(chunk("A", vec![2.0])).await.unwrap();
        store.save().await.unwrap();
        assert!(store.path().is_none());
        assert_eq!(store.total_count().await, 1);
    }
}
