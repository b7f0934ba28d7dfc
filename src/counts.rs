//! Per-conversation document counts.
//!
//! The cache answers one question cheaply: does this conversation
//! certainly own nothing? An absent entry means "unknown" and is never
//! treated as zero. Only [`DocumentCounts::mark_empty`] and a finished
//! [`Resync`] create entries; the add/remove hooks adjust entries that
//! already exist.
//!
//! A resync reads the index without holding the cache lock, so a hook can
//! land between the read and the apply. Ids touched while a resync is in
//! flight are dropped by that resync instead of being overwritten with the
//! older index figure.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::TRACING_TARGET;

#[derive(Debug, Default)]
struct Inner {
    counts: HashMap<String, usize>,
    /// Bumped by every resync start.
    generation: u64,
    /// Resyncs started and not yet finished or dropped.
    active: usize,
    /// Id → generation current when a hook last touched it. Only kept
    /// while a resync is in flight.
    touched: HashMap<String, u64>,
}

impl Inner {
    fn touch(&mut self, conversation_id: &str) {
        if self.active > 0 {
            self.touched.insert(conversation_id.to_string(), self.generation);
        }
    }

    fn touched_since(&self, conversation_id: &str, generation: u64) -> bool {
        self.touched
            .get(conversation_id)
            .is_some_and(|&stamp| stamp >= generation)
    }
}

#[derive(Debug, Default)]
pub struct DocumentCounts {
    inner: Mutex<Inner>,
}

impl DocumentCounts {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Known count, or `None` when the cache has no opinion.
    pub fn get(&self, conversation_id: &str) -> Option<usize> {
        self.lock().counts.get(conversation_id).copied()
    }

    /// True only when the cache affirmatively says zero.
    pub fn is_known_empty(&self, conversation_id: &str) -> bool {
        self.get(conversation_id) == Some(0)
    }

    pub fn mark_empty(&self, conversation_id: &str) {
        let mut inner = self.lock();
        inner.touch(conversation_id);
        inner.counts.insert(conversation_id.to_string(), 0);
    }

    pub fn added(&self, conversation_id: &str, n: usize) {
        if n == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.touch(conversation_id);
        if let Some(count) = inner.counts.get_mut(conversation_id) {
            *count = count.saturating_add(n);
        }
    }

    /// Subtract `n` from a known count. Removing more than the cache
    /// believed exists means the entry was wrong; it is dropped so the next
    /// query re-verifies against the index.
    pub fn removed(&self, conversation_id: &str, n: usize) {
        if n == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.touch(conversation_id);
        let Some(count) = inner.counts.get_mut(conversation_id) else {
            return;
        };
        if n > *count {
            let cached = *count;
            inner.counts.remove(conversation_id);
            tracing::warn!(
                target: TRACING_TARGET,
                conversation_id,
                cached,
                removed = n,
                "document count cache out of step with the index; entry dropped"
            );
        } else {
            *count -= n;
        }
    }

    pub fn invalidate(&self, conversation_id: &str) {
        let mut inner = self.lock();
        inner.touch(conversation_id);
        inner.counts.remove(conversation_id);
    }

    /// `moved` chunks now resolve to `conversation_id` instead of
    /// `pending_id`.
    pub fn moved(&self, pending_id: &str, conversation_id: &str, moved: usize) {
        if moved == 0 || pending_id == conversation_id {
            return;
        }
        let mut inner = self.lock();
        inner.touch(pending_id);
        inner.touch(conversation_id);
        if let Some(count) = inner.counts.get_mut(pending_id) {
            *count = count.saturating_sub(moved);
        }
        if let Some(count) = inner.counts.get_mut(conversation_id) {
            *count = count.saturating_add(moved);
        }
    }

    /// Start a resync. Read the index's live per-owner counts after this
    /// call, then hand them to [`Resync::finish`].
    pub fn begin_resync(&self) -> Resync<'_> {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.active += 1;
        Resync {
            counts: self,
            generation: inner.generation,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().counts.is_empty()
    }
}

/// An in-flight resync. Dropping it without [`finish`](Resync::finish)
/// leaves the cache as it was.
#[must_use]
pub struct Resync<'a> {
    counts: &'a DocumentCounts,
    generation: u64,
}

impl Resync<'_> {
    /// Replace known entries with `live`, the index's per-owner counts read
    /// after [`DocumentCounts::begin_resync`].
    ///
    /// Every owner in `live` becomes known. Previously known ids the index
    /// no longer mentions drop to zero. Ids a hook touched since the resync
    /// began become unknown. Returns the number of owners in `live`.
    pub fn finish(self, live: HashMap<String, usize>) -> usize {
        let owners = live.len();
        let mut inner = self.counts.lock();
        let generation = self.generation;
        let stale: Vec<String> = inner
            .counts
            .keys()
            .chain(live.keys())
            .filter(|id| inner.touched_since(id, generation))
            .cloned()
            .collect();

        for count in inner.counts.values_mut() {
            *count = 0;
        }
        inner.counts.extend(live);
        for id in &stale {
            inner.counts.remove(id);
        }
        if !stale.is_empty() {
            tracing::debug!(
                target: TRACING_TARGET,
                skipped = stale.len(),
                "counts changed during resync; left unknown"
            );
        }
        owners
    }
}

impl Drop for Resync<'_> {
    fn drop(&mut self) {
        let mut inner = self.counts.lock();
        inner.active -= 1;
        if inner.active == 0 {
            inner.touched.clear();
        }
    }
}
