//! Context selection under conversation isolation.
//!
//! [`ContextSelector`] decides, for one conversation and one query, which
//! chunks of the shared index are admissible context.
//!
//! # Algorithm
//!
//! 1. No conversation id under strict isolation → empty, nothing called.
//! 2. `top_k == 0` or an index with no live chunks → empty, nothing embedded.
//! 3. Embed the query. An embedding failure yields an empty result with the
//!    error recorded in [`SelectionDiagnostics`].
//! 4. Search the whole index for `search_k = min(live, top_k × fan_out)`
//!    candidates.
//! 5. Drop candidates whose resolved owner is not the querying
//!    conversation. Too few survivors is a legitimate answer; the index is
//!    never re-queried.
//! 6. Stable sort by descending score, truncate to `top_k`.
//!
//! Embedding and search share one deadline. It is enforced while a stage
//! is pending and checked again once the stage returns, so a backend that
//! finishes without yielding still reports the overrun. Exceeding it is
//! the only error this module returns.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout_at, Instant};

use specter_rag_core::embedding::Embedder;
use specter_rag_core::index::VectorIndex;
use specter_rag_core::models::{RetrievalResult, ScoredChunk};
use specter_rag_core::policy::{ConversationScope, IsolationPolicy};

use crate::config::RetrievalConfig;
use crate::error::{RetrievalError, Stage};
use crate::TRACING_TARGET;

/// Selector tuning, decoupled from the config file.
#[derive(Debug, Clone)]
pub struct SelectorParams {
    /// Candidates fetched per requested result.
    pub fan_out_factor: usize,
    /// Budget for embed + search.
    pub timeout: Duration,
    pub policy: IsolationPolicy,
}

impl Default for SelectorParams {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for SelectorParams {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            fan_out_factor: config.fan_out_factor.max(1),
            timeout: config.timeout(),
            policy: config.isolation,
        }
    }
}

/// Why the pipeline stopped before searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoConversation,
    ZeroTopK,
    EmptyIndex,
    EmbeddingFailed,
}

/// What one selection did. Observability only; never feeds back into
/// behaviour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionDiagnostics {
    pub policy: IsolationPolicy,
    pub search_k: usize,
    /// Hits returned by the index before filtering.
    pub candidates_examined: usize,
    /// Hits that passed the isolation check.
    pub admitted: usize,
    /// Hits handed back after truncation to `top_k`.
    pub returned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_error: Option<String>,
}

impl SelectionDiagnostics {
    fn new(policy: IsolationPolicy) -> Self {
        Self {
            policy,
            search_k: 0,
            candidates_examined: 0,
            admitted: 0,
            returned: 0,
            skipped: None,
            embedding_error: None,
        }
    }

    fn skip(mut self, reason: SkipReason) -> (RetrievalResult, Self) {
        self.skipped = Some(reason);
        (RetrievalResult::empty(), self)
    }
}

/// Filters a shared index down to one conversation's context.
///
/// Read-only: it never mutates chunks.
pub struct ContextSelector {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    params: SelectorParams,
}

impl ContextSelector {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>, params: SelectorParams) -> Self {
        Self {
            index,
            embedder,
            params,
        }
    }

    pub fn params(&self) -> &SelectorParams {
        &self.params
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Select context for `conversation_id` with the configured policy and
    /// time budget.
    pub async fn select(
        &self,
        conversation_id: Option<&str>,
        query_text: &str,
        top_k: usize,
    ) -> Result<(RetrievalResult, SelectionDiagnostics), RetrievalError> {
        let scope = ConversationScope::new(conversation_id, self.params.policy);
        self.select_scoped(scope, query_text, top_k, self.params.timeout)
            .await
    }

    /// Select context for an explicit scope and budget.
    pub async fn select_scoped(
        &self,
        scope: ConversationScope<'_>,
        query_text: &str,
        top_k: usize,
        budget: Duration,
    ) -> Result<(RetrievalResult, SelectionDiagnostics), RetrievalError> {
        let diag = SelectionDiagnostics::new(scope.policy());

        if scope.admits_nothing() {
            tracing::debug!(target: TRACING_TARGET, "no conversation id under strict isolation; skipping retrieval");
            return Ok(diag.skip(SkipReason::NoConversation));
        }
        if top_k == 0 {
            return Ok(diag.skip(SkipReason::ZeroTopK));
        }

        let deadline = Instant::now() + budget;

        let live = self.index.total_count().await;
        if live == 0 {
            return Ok(diag.skip(SkipReason::EmptyIndex));
        }

        let vector = match timeout_at(deadline, self.embedder.embed(query_text)).await {
            Err(_) => return Err(RetrievalError::timeout(Stage::Embed, budget)),
            Ok(Err(e)) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    conversation_id = scope.conversation_id(),
                    error = %e,
                    "query embedding failed; answering without file context"
                );
                let mut diag = diag;
                diag.embedding_error = Some(e.to_string());
                return Ok(diag.skip(SkipReason::EmbeddingFailed));
            }
            Ok(Ok(v)) => v,
        };
        if Instant::now() >= deadline {
            return Err(RetrievalError::timeout(Stage::Embed, budget));
        }

        let search_k = live.min(top_k.saturating_mul(self.params.fan_out_factor));
        let index = &self.index;
        let candidates = async {
            let hits = index.search(&vector, search_k).await;
            let mut resolved = Vec::with_capacity(hits.len());
            for hit in hits {
                // A chunk removed since the search simply drops out.
                let chunk = index.chunk(&hit.chunk_id).await;
                resolved.push((hit, chunk));
            }
            resolved
        };
        let candidates = timeout_at(deadline, candidates)
            .await
            .map_err(|_| RetrievalError::timeout(Stage::Search, budget))?;
        if Instant::now() >= deadline {
            return Err(RetrievalError::timeout(Stage::Search, budget));
        }

        let candidates_examined = candidates.len();
        let mut admitted: Vec<ScoredChunk> = candidates
            .into_iter()
            .filter_map(|(hit, chunk)| chunk.map(|c| (hit, c)))
            .filter(|(_, chunk)| scope.admits(chunk))
            .map(|(hit, chunk)| ScoredChunk {
                chunk,
                score: hit.score,
            })
            .collect();

        // Stable: equal scores keep the index's order.
        admitted.sort_by(|a, b| b.score.total_cmp(&a.score));
        let admitted_count = admitted.len();
        admitted.truncate(top_k);

        let diag = SelectionDiagnostics {
            search_k,
            candidates_examined,
            admitted: admitted_count,
            returned: admitted.len(),
            ..diag
        };
        tracing::debug!(
            target: TRACING_TARGET,
            conversation_id = scope.conversation_id(),
            policy = %diag.policy,
            search_k,
            candidates_examined,
            admitted = admitted_count,
            returned = diag.returned,
            "context selected"
        );

        Ok((RetrievalResult { hits: admitted }, diag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use async_trait::async_trait;
    use specter_rag_core::embedding::EmbeddingError;
    use specter_rag_core::index::memory::MemoryIndex;
    use specter_rag_core::index::Metric;
    use specter_rag_core::models::{ChunkOwner, DocumentChunk};

    const DIMS: usize = 128;

    async fn add(index: &MemoryIndex, owner: ChunkOwner, text: &str) -> String {
        let vector = HashEmbedder::new(DIMS).embed(text).await.unwrap();
        let chunk = DocumentChunk::new(&owner, "upload.txt", text, vector);
        let id = chunk.chunk_id.clone();
        index.add(chunk).await.unwrap();
        id
    }

    fn selector(index: Arc<MemoryIndex>, policy: IsolationPolicy) -> ContextSelector {
        let params = SelectorParams {
            policy,
            ..SelectorParams::default()
        };
        ContextSelector::new(index, Arc::new(HashEmbedder::new(DIMS)), params)
    }

    #[tokio::test]
    async fn test_admits_only_own_conversation() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        let mine = add(&index, ChunkOwner::Conversation("A".into()), "invoice total is $500").await;
        add(&index, ChunkOwner::Conversation("B".into()), "invoice total is $900").await;

        let (result, diag) = selector(index, IsolationPolicy::Strict)
            .select(Some("A"), "what is the total?", 3)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.hits[0].chunk.chunk_id, mine);
        assert_eq!(diag.candidates_examined, 2);
        assert_eq!(diag.admitted, 1);
        assert_eq!(diag.policy, IsolationPolicy::Strict);
    }

    #[tokio::test]
    async fn test_null_conversation_skips() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        add(&index, ChunkOwner::Conversation("A".into()), "anything at all").await;
        let sel = selector(index, IsolationPolicy::Strict);

        for id in [None, Some(""), Some("   ")] {
            let (result, diag) = sel.select(id, "anything", 3).await.unwrap();
            assert!(result.is_empty());
            assert_eq!(diag.skipped, Some(SkipReason::NoConversation));
            assert_eq!(diag.candidates_examined, 0);
        }
    }

    #[tokio::test]
    async fn test_unscoped_sees_everything() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        add(&index, ChunkOwner::Conversation("A".into()), "alpha notes").await;
        add(&index, ChunkOwner::Pending("P".into()), "alpha draft").await;

        let (result, diag) = selector(index, IsolationPolicy::Unscoped)
            .select(None, "alpha", 5)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(diag.policy, IsolationPolicy::Unscoped);
    }

    #[tokio::test]
    async fn test_search_k_bounded_by_live_count_and_fan_out() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        for i in 0..20 {
            add(&index, ChunkOwner::Conversation("A".into()), &format!("note {i}")).await;
        }
        let sel = selector(index.clone(), IsolationPolicy::Strict);

        let (result, diag) = sel.select(Some("A"), "note", 2).await.unwrap();
        assert_eq!(diag.search_k, 8);
        assert_eq!(result.len(), 2);
        assert_eq!(diag.admitted, 8);

        let (_, diag) = sel.select(Some("A"), "note", 10).await.unwrap();
        assert_eq!(diag.search_k, 20);
    }

    #[tokio::test]
    async fn test_sparse_result_is_not_refilled() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        add(&index, ChunkOwner::Conversation("A".into()), "quarterly revenue report").await;
        for i in 0..10 {
            add(&index, ChunkOwner::Conversation("B".into()), &format!("quarterly revenue {i}")).await;
        }
        let (result, diag) = selector(index, IsolationPolicy::Strict)
            .select(Some("A"), "quarterly revenue", 1)
            .await
            .unwrap();
        // search_k = 4 candidates, all of them B's closer matches or A's one.
        assert_eq!(diag.search_k, 4);
        assert!(result.len() <= 1);
        assert!(result.hits.iter().all(|h| h.chunk.owner() == Some("A")));
    }

    #[tokio::test]
    async fn test_results_sorted_and_deterministic() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        for text in ["rust borrow checker", "rust", "python decorators", "rust async runtime"] {
            add(&index, ChunkOwner::Conversation("A".into()), text).await;
        }
        let sel = selector(index, IsolationPolicy::Strict);
        let (first, _) = sel.select(Some("A"), "rust", 4).await.unwrap();
        let (second, _) = sel.select(Some("A"), "rust", 4).await.unwrap();
        assert_eq!(first, second);
        for pair in first.hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(first.hits[0].chunk.text, "rust");
    }

    #[tokio::test]
    async fn test_empty_index_and_zero_top_k_skip() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        let sel = selector(index.clone(), IsolationPolicy::Strict);
        let (_, diag) = sel.select(Some("A"), "q", 3).await.unwrap();
        assert_eq!(diag.skipped, Some(SkipReason::EmptyIndex));

        add(&index, ChunkOwner::Conversation("A".into()), "content").await;
        let (result, diag) = sel.select(Some("A"), "content", 0).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(diag.skipped, Some(SkipReason::ZeroTopK));
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_empty() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        add(&index, ChunkOwner::Conversation("A".into()), "content").await;
        let (result, diag) = selector(index, IsolationPolicy::Strict)
            .select(Some("A"), "   ", 3)
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(diag.skipped, Some(SkipReason::EmbeddingFailed));
        assert!(diag.embedding_error.is_some());
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            DIMS
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![0.0; DIMS])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_embed_timeout_surfaces() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        add(&index, ChunkOwner::Conversation("A".into()), "content").await;
        let params = SelectorParams {
            timeout: Duration::from_millis(50),
            ..SelectorParams::default()
        };
        let sel = ContextSelector::new(index, Arc::new(SlowEmbedder), params);
        let err = sel.select(Some("A"), "content", 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Timeout { stage: Stage::Embed, .. }));
    }

    #[tokio::test]
    async fn test_overrun_reported_when_embedder_never_yields() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        add(&index, ChunkOwner::Conversation("A".into()), "content").await;
        let sel = selector(index, IsolationPolicy::Strict);

        // HashEmbedder and MemoryIndex both finish on their first poll.
        let scope = ConversationScope::new(Some("A"), IsolationPolicy::Strict);
        let err = sel
            .select_scoped(scope, "content", 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Timeout { stage: Stage::Embed, .. }));
    }

    /// Embeds instantly but uses up the whole budget doing so.
    struct BudgetEatingEmbedder(Duration);

    #[async_trait]
    impl Embedder for BudgetEatingEmbedder {
        fn model_name(&self) -> &str {
            "budget-eating"
        }
        fn dims(&self) -> usize {
            DIMS
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let vector = HashEmbedder::new(DIMS).embed(text).await;
            tokio::time::advance(self.0).await;
            vector
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_embed_stage_overrun_without_pending_poll() {
        let index = Arc::new(MemoryIndex::new(DIMS, Metric::Cosine));
        add(&index, ChunkOwner::Conversation("A".into()), "content").await;
        let budget = Duration::from_millis(50);
        let params = SelectorParams {
            timeout: budget,
            ..SelectorParams::default()
        };
        let sel = ContextSelector::new(index, Arc::new(BudgetEatingEmbedder(budget)), params);
        let err = sel.select(Some("A"), "content", 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Timeout { stage: Stage::Embed, .. }));
    }
}
