//! Query entry point for chat turns.
//!
//! [`RetrievalSession`] sits in front of the [`ContextSelector`] and keeps
//! a per-conversation document count. When the count is known to be zero
//! the query returns empty without embedding or searching. Any other
//! state, including a missing entry, runs the full pipeline.
//!
//! The ingestion side keeps the count current through the hook methods
//! (`on_chunks_added`, `on_chunks_removed`, `on_conversation_persisted`).
//! Hooks are synchronous and must be called after the index write they
//! describe has returned.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use specter_rag_core::embedding::Embedder;
use specter_rag_core::index::VectorIndex;
use specter_rag_core::models::RetrievalResult;
use specter_rag_core::policy::{ConversationScope, IsolationPolicy};

use crate::config::RetrievalConfig;
use crate::counts::DocumentCounts;
use crate::error::RetrievalError;
use crate::selector::{ContextSelector, SelectionDiagnostics, SelectorParams};
use crate::TRACING_TARGET;

/// A query answer with the detail operators need to explain it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub result: RetrievalResult,
    /// The count cache said zero; nothing was embedded or searched.
    pub fast_path: bool,
    /// Absent on the fast path.
    pub diagnostics: Option<SelectionDiagnostics>,
}

pub struct RetrievalSession {
    selector: ContextSelector,
    counts: DocumentCounts,
    default_top_k: usize,
}

impl RetrievalSession {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: &RetrievalConfig,
    ) -> Self {
        // Chat queries are always strictly isolated.
        let params = SelectorParams {
            policy: IsolationPolicy::Strict,
            ..SelectorParams::from(config)
        };
        Self {
            selector: ContextSelector::new(index, embedder, params),
            counts: DocumentCounts::new(),
            default_top_k: config.top_k,
        }
    }

    pub fn selector(&self) -> &ContextSelector {
        &self.selector
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        self.selector.index()
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Context for one chat turn. Empty means "proceed without file
    /// context".
    pub async fn query(
        &self,
        conversation_id: Option<&str>,
        query_text: &str,
        top_k: usize,
    ) -> Result<RetrievalResult, RetrievalError> {
        self.query_with_diagnostics(conversation_id, query_text, top_k)
            .await
            .map(|outcome| outcome.result)
    }

    pub async fn query_with_diagnostics(
        &self,
        conversation_id: Option<&str>,
        query_text: &str,
        top_k: usize,
    ) -> Result<QueryOutcome, RetrievalError> {
        let budget = self.selector.params().timeout;
        self.query_within(conversation_id, query_text, top_k, budget)
            .await
    }

    /// Like [`query_with_diagnostics`](Self::query_with_diagnostics), with
    /// the caller's own time budget for embed and search.
    pub async fn query_within(
        &self,
        conversation_id: Option<&str>,
        query_text: &str,
        top_k: usize,
        budget: Duration,
    ) -> Result<QueryOutcome, RetrievalError> {
        if let Some(id) = conversation_id {
            if self.counts.is_known_empty(id) {
                tracing::debug!(target: TRACING_TARGET, conversation_id = id, "no documents cached; skipping retrieval");
                return Ok(QueryOutcome {
                    result: RetrievalResult::empty(),
                    fast_path: true,
                    diagnostics: None,
                });
            }
        }

        let scope = ConversationScope::new(conversation_id, self.selector.params().policy);
        let (result, diagnostics) = self
            .selector
            .select_scoped(scope, query_text, top_k, budget)
            .await?;
        Ok(QueryOutcome {
            result,
            fast_path: false,
            diagnostics: Some(diagnostics),
        })
    }

    /// `count` chunks now resolve to `conversation_id`.
    pub fn on_chunks_added(&self, conversation_id: &str, count: usize) {
        self.counts.added(conversation_id, count);
    }

    /// `count` chunks owned by `conversation_id` were soft-deleted.
    pub fn on_chunks_removed(&self, conversation_id: &str, count: usize) {
        self.counts.removed(conversation_id, count);
    }

    /// Forget the cached count; the next query runs the full pipeline.
    pub fn invalidate(&self, conversation_id: &str) {
        self.counts.invalidate(conversation_id);
    }

    /// Record that a newly created conversation owns nothing yet.
    pub fn mark_empty(&self, conversation_id: &str) {
        self.counts.mark_empty(conversation_id);
    }

    /// `moved` pending chunks were promoted to `conversation_id`.
    pub fn on_conversation_persisted(&self, pending_id: &str, conversation_id: &str, moved: usize) {
        self.counts.moved(pending_id, conversation_id, moved);
    }

    /// Rebuild counts from the index's live per-owner totals.
    ///
    /// Counts changed by a hook while the index is being read are left
    /// unknown rather than overwritten.
    pub async fn resync(&self) -> usize {
        let resync = self.counts.begin_resync();
        let live = self.index().owner_counts().await;
        let owners = resync.finish(live);
        tracing::info!(target: TRACING_TARGET, owners, "document counts resynced from index");
        owners
    }

    pub fn cached_count(&self, conversation_id: &str) -> Option<usize> {
        self.counts.get(conversation_id)
    }
}
