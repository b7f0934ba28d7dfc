//! Blocking wrapper around [`crate::session::RetrievalSession`].
//!
//! For call sites that cannot `.await`. The wrapper owns a current-thread
//! Tokio runtime and drives each call to completion on it. Like
//! `reqwest::blocking`, it must not be used from inside an async context;
//! doing so panics in Tokio.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use specter_rag_core::models::RetrievalResult;

use crate::error::RetrievalError;
use crate::session::{self, QueryOutcome};

pub struct RetrievalSession {
    inner: Arc<session::RetrievalSession>,
    runtime: Runtime,
}

impl RetrievalSession {
    pub fn new(inner: Arc<session::RetrievalSession>) -> Result<Self, RetrievalError> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| RetrievalError::Runtime(e.to_string()))?;
        Ok(Self { inner, runtime })
    }

    /// The async session this wrapper drives.
    pub fn inner(&self) -> &Arc<session::RetrievalSession> {
        &self.inner
    }

    pub fn query(
        &self,
        conversation_id: Option<&str>,
        query_text: &str,
        top_k: usize,
    ) -> Result<RetrievalResult, RetrievalError> {
        self.runtime
            .block_on(self.inner.query(conversation_id, query_text, top_k))
    }

    pub fn query_with_diagnostics(
        &self,
        conversation_id: Option<&str>,
        query_text: &str,
        top_k: usize,
    ) -> Result<QueryOutcome, RetrievalError> {
        self.runtime.block_on(
            self.inner
                .query_with_diagnostics(conversation_id, query_text, top_k),
        )
    }

    pub fn query_within(
        &self,
        conversation_id: Option<&str>,
        query_text: &str,
        top_k: usize,
        budget: Duration,
    ) -> Result<QueryOutcome, RetrievalError> {
        self.runtime.block_on(
            self.inner
                .query_within(conversation_id, query_text, top_k, budget),
        )
    }

    pub fn on_chunks_added(&self, conversation_id: &str, count: usize) {
        self.inner.on_chunks_added(conversation_id, count);
    }

    pub fn on_chunks_removed(&self, conversation_id: &str, count: usize) {
        self.inner.on_chunks_removed(conversation_id, count);
    }

    pub fn invalidate(&self, conversation_id: &str) {
        self.inner.invalidate(conversation_id);
    }

    pub fn mark_empty(&self, conversation_id: &str) {
        self.inner.mark_empty(conversation_id);
    }

    pub fn on_conversation_persisted(&self, pending_id: &str, conversation_id: &str, moved: usize) {
        self.inner
            .on_conversation_persisted(pending_id, conversation_id, moved);
    }

    pub fn resync(&self) -> usize {
        self.runtime.block_on(self.inner.resync())
    }

    pub fn cached_count(&self, conversation_id: &str) -> Option<usize> {
        self.inner.cached_count(conversation_id)
    }
}
