//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the single shared index that holds chunks
//! from every conversation. It has no notion of isolation: `search` ranks
//! the whole index and callers filter the hits afterwards.
//!
//! Removal is soft. A removed chunk keeps its slot but is never returned
//! again; only an explicit compaction reclaims space.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::{cosine_similarity, inner_product};
use crate::models::DocumentChunk;

/// Result type for index mutations.
pub type IndexResult<T> = Result<T, IndexWriteError>;

/// A write to the index failed.
#[derive(Debug, Error)]
pub enum IndexWriteError {
    /// Vector length differs from the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector contains NaN or infinite components.
    #[error("vector for chunk {0} contains non-finite values")]
    InvalidVector(String),

    /// A chunk with this id is already stored.
    #[error("duplicate chunk id: {0}")]
    DuplicateChunk(String),

    /// Persisting the index failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl IndexWriteError {
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Similarity function used to rank neighbours.
///
/// Must match how the embedding model was trained; treat it as
/// configuration rather than something to switch per query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    InnerProduct,
}

impl Metric {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::InnerProduct => inner_product(a, b),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::InnerProduct => f.write_str("inner_product"),
        }
    }
}

/// One nearest-neighbour match.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

/// Shared nearest-neighbour index over all conversations.
///
/// Writes (`add`, `add_batch`, `remove_*`, `assign_conversation`) are serialized by the
/// implementation. `search` may run concurrently with a write and is
/// allowed to miss it.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`add`](VectorIndex::add) | Append one chunk |
/// | [`add_batch`](VectorIndex::add_batch) | Append one upload's chunks atomically |
/// | [`search`](VectorIndex::search) | Top-`k` live chunks by similarity |
/// | [`chunk`](VectorIndex::chunk) | Metadata lookup for a hit |
/// | [`remove_by_conversation`](VectorIndex::remove_by_conversation) | Soft-delete a conversation's chunks |
/// | [`remove_file`](VectorIndex::remove_file) | Soft-delete one file's chunks |
/// | [`assign_conversation`](VectorIndex::assign_conversation) | Promote pending chunks |
/// | [`total_count`](VectorIndex::total_count) | Live chunk count |
/// | [`owner_counts`](VectorIndex::owner_counts) | Live chunks per resolved owner |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimension every stored vector must have.
    fn dims(&self) -> usize;

    fn metric(&self) -> Metric;

    /// Append a chunk. Rejects wrong dimensions, non-finite vectors, and
    /// duplicate ids.
    async fn add(&self, chunk: DocumentChunk) -> IndexResult<()>;

    /// Append every chunk or none of them. Returns how many were stored.
    async fn add_batch(&self, chunks: Vec<DocumentChunk>) -> IndexResult<usize>;

    /// Up to `k` live chunks ordered by descending score. Equal scores keep
    /// insertion order. An empty index yields an empty list.
    async fn search(&self, vector: &[f32], k: usize) -> Vec<SearchHit>;

    /// Live chunk by id, or `None` if unknown or removed.
    async fn chunk(&self, chunk_id: &str) -> Option<DocumentChunk>;

    /// Soft-delete every live chunk whose resolved owner is
    /// `conversation_id`, whether it got there through the pending or the
    /// confirmed field. Returns how many were removed.
    async fn remove_by_conversation(&self, conversation_id: &str) -> IndexResult<usize>;

    /// Soft-delete live chunks from `source_filename` whose resolved owner is
    /// `conversation_id`.
    async fn remove_file(&self, conversation_id: &str, source_filename: &str) -> IndexResult<usize>;

    /// Set `conversation_id` on every live chunk that currently resolves to
    /// `pending_id`. The pending id is left in place. Returns how many
    /// chunks changed owner.
    async fn assign_conversation(&self, pending_id: &str, conversation_id: &str) -> IndexResult<usize>;

    /// Number of live (non-deleted) chunks.
    async fn total_count(&self) -> usize;

    /// Live chunk count keyed by resolved owner. Ownerless chunks are
    /// omitted.
    async fn owner_counts(&self) -> HashMap<String, usize>;
}

/// Check a vector against the index dimension before it is stored.
pub fn validate_vector(chunk: &DocumentChunk, dims: usize) -> IndexResult<()> {
    if chunk.vector.len() != dims {
        return Err(IndexWriteError::dimension_mismatch(dims, chunk.vector.len()));
    }
    if chunk.vector.iter().any(|x| !x.is_finite()) {
        return Err(IndexWriteError::InvalidVector(chunk.chunk_id.clone()));
    }
    Ok(())
}
