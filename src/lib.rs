//! # Specter RAG
//!
//! Conversation-scoped retrieval over a single shared vector index.
//!
//! Every uploaded file is chunked, embedded and stored in one index shared
//! by all conversations. Each chunk records who owns it: a persisted
//! conversation, or a pending one that has not been saved yet. At query
//! time the hits are filtered so a conversation only ever sees its own
//! chunks; a missing conversation id sees nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────────┐
//! │  Ingestor  │──▶│  Embedder  │──▶│ VectorIndexStore │
//! │ chunk+add  │   │ hash/HTTP  │   │ memory+snapshot  │
//! └─────┬──────┘   └────────────┘   └────────┬────────┘
//!       │ count hooks                        │ search
//!       ▼                                    ▼
//! ┌──────────────────┐            ┌─────────────────┐
//! │ RetrievalSession │───────────▶│ ContextSelector │
//! │  count fast path │            │ isolation filter│
//! └──────────────────┘            └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! specter-rag ingest --conversation c1 ./invoices
//! specter-rag query --conversation c1 "what is the total?"
//! specter-rag promote --pending tmp-7 --conversation c2
//! specter-rag stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding providers (hash, OpenAI, Ollama) |
//! | [`store`] | Persistent shared vector index |
//! | [`snapshot`] | On-disk snapshot format |
//! | [`selector`] | Isolation-filtered context selection |
//! | [`session`] | Query entry point with the document count fast path |
//! | [`counts`] | Per-conversation document counts |
//! | [`blocking`] | Blocking session wrapper |
//! | [`ingest`] | Upload ingestion, removal and promotion |
//! | [`stats`] | Index statistics |
//! | [`logging`] | Tracing setup for the binary |
//! | [`error`] | Error types |

pub mod blocking;
pub mod config;
pub mod counts;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod selector;
pub mod session;
pub mod snapshot;
pub mod stats;
pub mod store;

pub use specter_rag_core::{chunk, models, policy};

/// Tracing target for everything logged by this crate.
pub const TRACING_TARGET: &str = "specter_rag";
