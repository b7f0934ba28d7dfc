//! # Specter RAG Core
//!
//! Runtime-free logic for conversation-scoped retrieval: chunk models,
//! the ownership/isolation policy, text chunking, the embedding trait,
//! and the vector index trait with its in-memory implementation.
//!
//! This crate contains no tokio, filesystem I/O, or network code. The
//! `specter-rag` application crate layers timeouts, persistence, concrete
//! embedding providers, and the retrieval session on top of it.

pub mod chunk;
pub mod embedding;
pub mod index;
pub mod models;
pub mod policy;

/// Tracing target used by every log event emitted from this crate.
pub const TRACING_TARGET: &str = "specter_rag_core";
