//! In-memory [`VectorIndex`] implementation.
//!
//! Flat brute-force index: every search scores all live slots. Slots live
//! in a `Vec` behind `std::sync::RwLock`, so searches share a read lock and
//! writes take the write lock one at a time. Removal flips a tombstone flag;
//! the vector stays in place until [`MemoryIndex::compact`].

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::models::DocumentChunk;
use crate::TRACING_TARGET;

use super::{validate_vector, IndexResult, IndexWriteError, Metric, SearchHit, VectorIndex};

/// One stored chunk plus its tombstone flag.
#[derive(Debug, Clone)]
pub struct Slot {
    pub chunk: DocumentChunk,
    pub deleted: bool,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    positions: HashMap<String, usize>,
    live: usize,
}

impl Inner {
    fn rebuild_positions(&mut self) {
        self.positions = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.chunk.chunk_id.clone(), i))
            .collect();
        self.live = self.slots.iter().filter(|s| !s.deleted).count();
    }

    /// Tombstone every live slot matching `pred`. Returns the positions
    /// that changed.
    fn soft_delete(&mut self, pred: impl Fn(&DocumentChunk) -> bool) -> Vec<usize> {
        let mut removed = Vec::new();
        for (pos, slot) in self.slots.iter_mut().enumerate().filter(|(_, s)| !s.deleted) {
            if pred(&slot.chunk) {
                slot.deleted = true;
                removed.push(pos);
            }
        }
        self.live -= removed.len();
        removed
    }
}

/// Flat in-memory index shared by all conversations.
pub struct MemoryIndex {
    dims: usize,
    metric: Metric,
    inner: RwLock<Inner>,
}

impl MemoryIndex {
    pub fn new(dims: usize, metric: Metric) -> Self {
        Self {
            dims,
            metric,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Restore an index from previously exported slots, tombstones included.
    pub fn from_slots(dims: usize, metric: Metric, slots: Vec<Slot>) -> Self {
        let mut inner = Inner {
            slots,
            ..Inner::default()
        };
        inner.rebuild_positions();
        Self {
            dims,
            metric,
            inner: RwLock::new(inner),
        }
    }

    /// Copy of every slot in storage order, for persistence.
    pub fn export_slots(&self) -> Vec<Slot> {
        self.read().slots.clone()
    }

    /// Total slots, live and tombstoned.
    pub fn slot_count(&self) -> usize {
        self.read().slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.read().live
    }

    pub fn tombstone_count(&self) -> usize {
        let inner = self.read();
        inner.slots.len() - inner.live
    }

    /// Drop tombstoned slots. Returns how many were reclaimed.
    pub fn compact(&self) -> usize {
        let mut inner = self.write();
        let before = inner.slots.len();
        inner.slots.retain(|s| !s.deleted);
        inner.rebuild_positions();
        let reclaimed = before - inner.slots.len();
        tracing::info!(target: TRACING_TARGET, reclaimed, "compacted index");
        reclaimed
    }

    /// Append `chunks` in order. Every chunk is validated before any is
    /// stored, so a rejected batch leaves the index unchanged.
    pub fn append(&self, chunks: Vec<DocumentChunk>) -> IndexResult<usize> {
        let mut inner = self.write();
        {
            let mut incoming = HashSet::with_capacity(chunks.len());
            for chunk in &chunks {
                validate_vector(chunk, self.dims)?;
                if inner.positions.contains_key(&chunk.chunk_id) || !incoming.insert(chunk.chunk_id.as_str()) {
                    return Err(IndexWriteError::DuplicateChunk(chunk.chunk_id.clone()));
                }
            }
        }
        let added = chunks.len();
        for chunk in chunks {
            let pos = inner.slots.len();
            inner.positions.insert(chunk.chunk_id.clone(), pos);
            inner.slots.push(Slot {
                chunk,
                deleted: false,
            });
        }
        inner.live += added;
        Ok(added)
    }

    /// Drop every slot at or after `len`. Undoes an [`append`](Self::append).
    pub fn truncate(&self, len: usize) {
        let mut inner = self.write();
        if len >= inner.slots.len() {
            return;
        }
        let dropped: Vec<Slot> = inner.slots.drain(len..).collect();
        for slot in &dropped {
            inner.positions.remove(&slot.chunk.chunk_id);
        }
        inner.live -= dropped.iter().filter(|s| !s.deleted).count();
    }

    /// Tombstone live chunks resolving to `conversation_id`, optionally
    /// only those from `source_filename`. Returns the changed positions.
    pub fn tombstone_owned(&self, conversation_id: &str, source_filename: Option<&str>) -> Vec<usize> {
        self.write().soft_delete(|c| {
            c.owner() == Some(conversation_id)
                && source_filename.map_or(true, |name| c.source_filename == name)
        })
    }

    /// Clear the tombstone on each position. Undoes a
    /// [`tombstone_owned`](Self::tombstone_owned).
    pub fn restore(&self, positions: &[usize]) {
        let mut inner = self.write();
        let mut revived = 0;
        for &pos in positions {
            if let Some(slot) = inner.slots.get_mut(pos).filter(|s| s.deleted) {
                slot.deleted = false;
                revived += 1;
            }
        }
        inner.live += revived;
    }

    /// Confirm live pending chunks of `pending_id` as `conversation_id`.
    /// Returns the changed positions.
    pub fn promote(&self, pending_id: &str, conversation_id: &str) -> Vec<usize> {
        let mut inner = self.write();
        let mut moved = Vec::new();
        for (pos, slot) in inner.slots.iter_mut().enumerate().filter(|(_, s)| !s.deleted) {
            if slot.chunk.is_unconfirmed()
                && slot.chunk.pending_conversation_id.as_deref() == Some(pending_id)
            {
                slot.chunk.conversation_id = Some(conversation_id.to_string());
                moved.push(pos);
            }
        }
        moved
    }

    /// Clear `conversation_id` on each position. Undoes a
    /// [`promote`](Self::promote).
    pub fn demote(&self, positions: &[usize]) {
        let mut inner = self.write();
        for &pos in positions {
            if let Some(slot) = inner.slots.get_mut(pos) {
                slot.chunk.conversation_id = None;
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    async fn add(&self, chunk: DocumentChunk) -> IndexResult<()> {
        self.append(vec![chunk]).map(|_| ())
    }

    async fn add_batch(&self, chunks: Vec<DocumentChunk>) -> IndexResult<usize> {
        self.append(chunks)
    }

    async fn search(&self, vector: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || vector.len() != self.dims {
            return Vec::new();
        }
        let inner = self.read();
        let mut scored: Vec<(usize, f32)> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.deleted)
            .map(|(i, s)| (i, self.metric.score(vector, &s.chunk.vector)))
            .collect();
        // Stable: equal scores keep storage order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(i, score)| SearchHit {
                chunk_id: inner.slots[i].chunk.chunk_id.clone(),
                score,
            })
            .collect()
    }

    async fn chunk(&self, chunk_id: &str) -> Option<DocumentChunk> {
        let inner = self.read();
        let pos = *inner.positions.get(chunk_id)?;
        let slot = &inner.slots[pos];
        (!slot.deleted).then(|| slot.chunk.clone())
    }

    async fn remove_by_conversation(&self, conversation_id: &str) -> IndexResult<usize> {
        Ok(self.tombstone_owned(conversation_id, None).len())
    }

    async fn remove_file(&self, conversation_id: &str, source_filename: &str) -> IndexResult<usize> {
        Ok(self.tombstone_owned(conversation_id, Some(source_filename)).len())
    }

    async fn assign_conversation(&self, pending_id: &str, conversation_id: &str) -> IndexResult<usize> {
        Ok(self.promote(pending_id, conversation_id).len())
    }

    async fn total_count(&self) -> usize {
        self.live_count()
    }

    async fn owner_counts(&self) -> HashMap<String, usize> {
        let inner = self.read();
        let mut counts = HashMap::new();
        for slot in inner.slots.iter().filter(|s| !s.deleted) {
            if let Some(owner) = slot.chunk.owner() {
                *counts.entry(owner.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }
}
