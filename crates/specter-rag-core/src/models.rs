//! Core data models for conversation-scoped retrieval.
//!
//! These types describe the chunks stored in the shared vector index and
//! the ranked results handed back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A slice of an uploaded document, embedded independently and stored in
/// the shared index.
///
/// Ownership is carried by two optional fields. `conversation_id` is set
/// once the owning conversation has been persisted; before that the chunk
/// is keyed by `pending_conversation_id`. When both are present,
/// `conversation_id` wins (see [`DocumentChunk::owner`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub text: String,
    pub conversation_id: Option<String>,
    pub pending_conversation_id: Option<String>,
    pub source_filename: String,
    pub upload_timestamp: DateTime<Utc>,
}

impl DocumentChunk {
    /// Build a chunk with a fresh UUID, owned as described by `owner`.
    pub fn new(
        owner: &ChunkOwner,
        source_filename: impl Into<String>,
        text: impl Into<String>,
        vector: Vec<f32>,
    ) -> Self {
        let (conversation_id, pending_conversation_id) = match owner {
            ChunkOwner::Conversation(id) => (Some(id.clone()), None),
            ChunkOwner::Pending(id) => (None, Some(id.clone())),
        };
        Self {
            chunk_id: Uuid::new_v4().to_string(),
            vector,
            text: text.into(),
            conversation_id,
            pending_conversation_id,
            source_filename: source_filename.into(),
            upload_timestamp: Utc::now(),
        }
    }

    /// The id this chunk currently resolves to.
    ///
    /// `conversation_id` takes precedence over `pending_conversation_id`;
    /// a stale pending id left behind after promotion never resolves.
    /// Empty ids are treated as unset.
    pub fn owner(&self) -> Option<&str> {
        non_empty(self.conversation_id.as_deref())
            .or_else(|| non_empty(self.pending_conversation_id.as_deref()))
    }

    /// `true` when no non-empty `conversation_id` is set.
    pub fn is_unconfirmed(&self) -> bool {
        non_empty(self.conversation_id.as_deref()).is_none()
    }
}

fn non_empty(id: Option<&str>) -> Option<&str> {
    id.filter(|id| !id.is_empty())
}

/// Who an ingested chunk belongs to at upload time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChunkOwner {
    /// A conversation already committed to durable storage.
    Conversation(String),
    /// A conversation that exists only in memory so far.
    Pending(String),
}

impl ChunkOwner {
    pub fn id(&self) -> &str {
        match self {
            ChunkOwner::Conversation(id) | ChunkOwner::Pending(id) => id,
        }
    }
}

/// A chunk paired with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// Ranked context for one query, most similar first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Chunk texts in rank order, ready to be spliced into a prompt.
    pub fn snippets(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.chunk.text.as_str()).collect()
    }
}
