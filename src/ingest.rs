//! Upload ingestion.
//!
//! Chunk → embed → store → notify. Every write to the shared index is
//! followed, in the same call, by the matching count hook on the
//! [`RetrievalSession`], so the fast path never trusts a stale zero.
//!
//! All chunks of a file are embedded first and then stored with one
//! [`VectorIndex::add_batch`] call, so a file is either fully searchable or
//! not stored at all, and a persisted index saves once per file.

use std::sync::Arc;

use serde::Serialize;

use specter_rag_core::chunk::chunk_text;
use specter_rag_core::embedding::{Embedder, EmbeddingError};
use specter_rag_core::index::VectorIndex;
use specter_rag_core::models::{ChunkOwner, DocumentChunk};

use crate::config::Config;
use crate::error::IngestError;
use crate::session::RetrievalSession;
use crate::TRACING_TARGET;

/// What one upload stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub owner: String,
    pub pending: bool,
    pub filename: String,
    pub chunk_ids: Vec<String>,
}

impl IngestReport {
    pub fn chunks(&self) -> usize {
        self.chunk_ids.len()
    }
}

pub struct Ingestor {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    session: Arc<RetrievalSession>,
    max_tokens: usize,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        session: Arc<RetrievalSession>,
        config: &Config,
    ) -> Self {
        Self {
            index,
            embedder,
            session,
            max_tokens: config.chunking.max_tokens,
            batch_size: config.embedding.batch_size.max(1),
        }
    }

    pub fn session(&self) -> &Arc<RetrievalSession> {
        &self.session
    }

    /// Chunk, embed and store `text` as `filename`, owned by `owner`.
    pub async fn ingest_text(
        &self,
        owner: &ChunkOwner,
        filename: &str,
        text: &str,
    ) -> Result<IngestReport, IngestError> {
        let owner_id = owner.id();
        if owner_id.trim().is_empty() {
            return Err(IngestError::MissingOwner);
        }

        let pieces = chunk_text(text, self.max_tokens);
        let texts: Vec<String> = pieces.into_iter().map(|c| c.text).collect();

        let mut vectors = Vec::with_capacity(texts.len());
        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let embedded = self
                .embedder
                .embed_batch(batch)
                .await
                .map_err(|source| IngestError::Embedding {
                    filename: filename.to_string(),
                    index: batch_no * self.batch_size,
                    source,
                })?;
            if embedded.len() != batch.len() {
                return Err(IngestError::Embedding {
                    filename: filename.to_string(),
                    index: batch_no * self.batch_size,
                    source: EmbeddingError::invalid_response(format!(
                        "{} vectors for {} texts",
                        embedded.len(),
                        batch.len()
                    )),
                });
            }
            vectors.extend(embedded);
        }

        let chunks: Vec<DocumentChunk> = texts
            .into_iter()
            .zip(vectors)
            .map(|(text, vector)| DocumentChunk::new(owner, filename, text, vector))
            .collect();
        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        if !chunks.is_empty() {
            if let Err(source) = self.index.add_batch(chunks).await {
                tracing::warn!(
                    target: TRACING_TARGET,
                    owner = owner_id,
                    filename,
                    error = %source,
                    "upload rejected by index write failure"
                );
                return Err(IngestError::Write {
                    filename: filename.to_string(),
                    source,
                });
            }
        }
        self.session.on_chunks_added(owner_id, chunk_ids.len());

        tracing::info!(
            target: TRACING_TARGET,
            owner = owner_id,
            pending = matches!(owner, ChunkOwner::Pending(_)),
            filename,
            chunks = chunk_ids.len(),
            "document ingested"
        );

        Ok(IngestReport {
            owner: owner_id.to_string(),
            pending: matches!(owner, ChunkOwner::Pending(_)),
            filename: filename.to_string(),
            chunk_ids,
        })
    }

    /// Soft-delete one file's chunks from a conversation.
    pub async fn remove_file(&self, conversation_id: &str, filename: &str) -> Result<usize, IngestError> {
        let removed = self
            .index
            .remove_file(conversation_id, filename)
            .await?;
        self.session.on_chunks_removed(conversation_id, removed);
        tracing::info!(target: TRACING_TARGET, conversation_id, filename, removed, "file removed");
        Ok(removed)
    }

    /// Soft-delete everything a conversation owns, e.g. when it is deleted.
    pub async fn remove_conversation(&self, conversation_id: &str) -> Result<usize, IngestError> {
        let removed = self
            .index
            .remove_by_conversation(conversation_id)
            .await?;
        self.session.on_chunks_removed(conversation_id, removed);
        tracing::info!(target: TRACING_TARGET, conversation_id, removed, "conversation documents removed");
        Ok(removed)
    }

    /// Re-key a pending conversation's chunks once it has been persisted.
    pub async fn promote_pending(&self, pending_id: &str, conversation_id: &str) -> Result<usize, IngestError> {
        if pending_id.trim().is_empty() || conversation_id.trim().is_empty() {
            return Err(IngestError::MissingOwner);
        }
        let moved = self
            .index
            .assign_conversation(pending_id, conversation_id)
            .await?;
        self.session
            .on_conversation_persisted(pending_id, conversation_id, moved);
        tracing::info!(target: TRACING_TARGET, pending_id, conversation_id, moved, "pending conversation promoted");
        Ok(moved)
    }
}
