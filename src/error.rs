//! Error types for the retrieval layer.
//!
//! Embedding failures ([`EmbeddingError`]) are absorbed by the selector and
//! reported through diagnostics. Index write failures ([`IndexWriteError`])
//! travel back to the ingestion caller. A blown time budget is the one
//! failure the query path propagates.

use std::time::Duration;

use thiserror::Error;

pub use specter_rag_core::embedding::EmbeddingError;
pub use specter_rag_core::index::IndexWriteError;

/// Which step of the pipeline ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Embed,
    Search,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Embed => f.write_str("embed"),
            Stage::Search => f.write_str("search"),
        }
    }
}

/// Failure surfaced to query callers.
///
/// Callers should treat every variant as "no context available this turn".
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Embedding or search exceeded the caller's budget.
    #[error("{stage} exceeded the {budget:?} retrieval budget")]
    Timeout { stage: Stage, budget: Duration },

    /// The blocking façade could not start its runtime.
    #[error("retrieval runtime unavailable: {0}")]
    Runtime(String),
}

impl RetrievalError {
    pub fn timeout(stage: Stage, budget: Duration) -> Self {
        Self::Timeout { stage, budget }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failure during ingestion. Never swallowed: upload status must show it.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to embed chunk {index} of {filename}: {source}")]
    Embedding {
        filename: String,
        index: usize,
        #[source]
        source: EmbeddingError,
    },

    /// The file's chunks were rejected as a whole; none were stored.
    #[error("failed to store {filename}: {source}")]
    Write {
        filename: String,
        #[source]
        source: IndexWriteError,
    },

    /// A removal or promotion could not be applied.
    #[error("index update failed: {0}")]
    Index(#[from] IndexWriteError),

    #[error("conversation id must not be empty")]
    MissingOwner,
}
