//! # Specter RAG CLI (`specter-rag`)
//!
//! Operator interface to the shared, conversation-scoped vector index:
//! upload files into a conversation, query with isolation applied, remove
//! or promote a conversation's documents, and inspect or compact the
//! index.
//!
//! ## Usage
//!
//! ```bash
//! specter-rag --config ./config/specter.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `specter-rag ingest` | Chunk, embed and store files for a conversation |
//! | `specter-rag query "<text>"` | Retrieve context for a conversation |
//! | `specter-rag remove` | Soft-delete a conversation's documents, or one file |
//! | `specter-rag promote` | Re-key a pending conversation's documents |
//! | `specter-rag stats` | Show live/tombstoned chunks per conversation |
//! | `specter-rag compact` | Rewrite the index without tombstones |
//!
//! ## Examples
//!
//! ```bash
//! # Upload a folder into a persisted conversation
//! specter-rag ingest --conversation c1 ./invoices
//!
//! # Upload before the conversation has been saved
//! specter-rag ingest --pending tmp-7 ./draft.md
//! specter-rag promote --pending tmp-7 --conversation c2
//!
//! # Query, isolated to one conversation
//! specter-rag query --conversation c1 "what is the total?"
//!
//! # Query across every conversation (operator only)
//! specter-rag query --all "total"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use walkdir::WalkDir;

use specter_rag::config::{self, Config};
use specter_rag::embedding::create_embedder;
use specter_rag::ingest::Ingestor;
use specter_rag::logging;
use specter_rag::models::{ChunkOwner, RetrievalResult};
use specter_rag::policy::{ConversationScope, IsolationPolicy};
use specter_rag::selector::SelectionDiagnostics;
use specter_rag::session::RetrievalSession;
use specter_rag::stats;
use specter_rag::store::VectorIndexStore;
use specter_rag_core::embedding::Embedder;
use specter_rag_core::index::VectorIndex;

/// Specter RAG CLI: conversation-scoped retrieval over a shared vector
/// index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, an in-memory index and the offline hashing embedder
/// are used.
#[derive(Parser)]
#[command(
    name = "specter-rag",
    about = "Specter RAG — conversation-scoped retrieval over a shared vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk, embed and store files for one conversation.
    ///
    /// Directories are walked recursively for `.txt` and `.md` files.
    #[command(group(ArgGroup::new("owner").required(true).args(["conversation", "pending"])))]
    Ingest {
        /// Persisted conversation that owns the upload.
        #[arg(long)]
        conversation: Option<String>,

        /// Pending (not yet persisted) conversation that owns the upload.
        #[arg(long)]
        pending: Option<String>,

        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Retrieve context for a query.
    #[command(group(ArgGroup::new("scope").args(["conversation", "all"])))]
    Query {
        /// Query text.
        query: String,

        /// Conversation to retrieve for.
        #[arg(long)]
        conversation: Option<String>,

        /// Search every conversation, ignoring isolation.
        #[arg(long)]
        all: bool,

        /// Maximum results (defaults to `retrieval.top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Soft-delete a conversation's documents, or a single file.
    Remove {
        #[arg(long)]
        conversation: String,

        /// Only remove chunks from this file.
        #[arg(long)]
        file: Option<String>,
    },

    /// Attach a pending conversation's documents to its persisted id.
    Promote {
        #[arg(long)]
        pending: String,

        #[arg(long)]
        conversation: String,
    },

    /// Show index statistics.
    Stats,

    /// Rewrite the index without tombstoned chunks.
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing()?;
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    let embedder = create_embedder(&cfg.embedding)?;
    let store = Arc::new(VectorIndexStore::from_config(&cfg.index, embedder.dims()));
    let session = Arc::new(RetrievalSession::new(
        store.clone(),
        embedder.clone(),
        &cfg.retrieval,
    ));

    match cli.command {
        Commands::Ingest {
            conversation,
            pending,
            paths,
        } => {
            let owner = match (conversation, pending) {
                (Some(id), _) => ChunkOwner::Conversation(id),
                (None, Some(id)) => ChunkOwner::Pending(id),
                (None, None) => bail!("one of --conversation or --pending is required"),
            };
            let ingestor = Ingestor::new(store.clone(), embedder, session, &cfg);
            let files = collect_files(&paths)?;
            if files.is_empty() {
                bail!("no .txt or .md files found");
            }

            let mut chunks = 0;
            for (path, name) in &files {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let report = ingestor.ingest_text(&owner, name, &text).await?;
                println!("  {:<40} {:>4} chunks", name, report.chunks());
                chunks += report.chunks();
            }
            save_unless_persisted(&cfg, &store).await?;

            println!("ingest {}", owner.id());
            println!("  files: {}", files.len());
            println!("  chunks: {}", chunks);
            println!("ok");
        }
        Commands::Query {
            query,
            conversation,
            all,
            top_k,
        } => {
            let top_k = top_k.unwrap_or(cfg.retrieval.top_k);
            let unscoped = all || cfg.retrieval.isolation == IsolationPolicy::Unscoped;
            let (result, diagnostics) = if unscoped {
                let scope = ConversationScope::new(None, IsolationPolicy::Unscoped);
                session
                    .selector()
                    .select_scoped(scope, &query, top_k, cfg.retrieval.timeout())
                    .await?
            } else {
                session.resync().await;
                let outcome = session
                    .query_with_diagnostics(conversation.as_deref(), &query, top_k)
                    .await?;
                let Some(diagnostics) = outcome.diagnostics else {
                    println!("No documents in this conversation.");
                    return Ok(());
                };
                (outcome.result, diagnostics)
            };
            print_result(&result, &diagnostics);
        }
        Commands::Remove { conversation, file } => {
            let ingestor = Ingestor::new(store.clone(), embedder, session, &cfg);
            let removed = match &file {
                Some(name) => ingestor.remove_file(&conversation, name).await?,
                None => ingestor.remove_conversation(&conversation).await?,
            };
            save_unless_persisted(&cfg, &store).await?;
            println!("removed {} chunks", removed);
        }
        Commands::Promote {
            pending,
            conversation,
        } => {
            let ingestor = Ingestor::new(store.clone(), embedder, session, &cfg);
            let moved = ingestor.promote_pending(&pending, &conversation).await?;
            save_unless_persisted(&cfg, &store).await?;
            println!("promoted {} chunks from {} to {}", moved, pending, conversation);
        }
        Commands::Stats => {
            stats::run_stats(&store).await;
        }
        Commands::Compact => {
            let reclaimed = store.compact().await?;
            println!("compacted: {} tombstoned slots reclaimed", reclaimed);
            println!("  live chunks: {}", store.total_count().await);
        }
    }

    Ok(())
}

/// Expand `paths` into `(path, display name)` pairs. Files inside a
/// directory are named relative to it.
fn collect_files(paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| root.display().to_string());
            files.push((root.clone(), name));
            continue;
        }
        if !root.exists() {
            bail!("Path does not exist: {}", root.display());
        }
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() || !is_text_file(entry.path()) {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            files.push((path.to_path_buf(), relative.to_string_lossy().to_string()));
        }
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn is_text_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("txt") | Some("md")
    )
}

async fn save_unless_persisted(cfg: &Config, store: &VectorIndexStore) -> Result<()> {
    if !cfg.index.persist_on_write {
        store.save().await?;
    }
    Ok(())
}

fn print_result(result: &RetrievalResult, diagnostics: &SelectionDiagnostics) {
    if result.is_empty() {
        println!("No results.");
    }
    for (rank, hit) in result.hits.iter().enumerate() {
        let owner = hit.chunk.owner().unwrap_or("-");
        println!(
            "{}. [{:.4}] {} ({})",
            rank + 1,
            hit.score,
            hit.chunk.source_filename,
            owner
        );
        let snippet: String = hit.chunk.text.chars().take(200).collect();
        println!("    {}", snippet.replace('\n', " "));
    }

    println!();
    println!(
        "policy: {}  search_k: {}  examined: {}  admitted: {}  returned: {}",
        diagnostics.policy,
        diagnostics.search_k,
        diagnostics.candidates_examined,
        diagnostics.admitted,
        diagnostics.returned
    );
    if let Some(reason) = diagnostics.skipped {
        println!("skipped: {:?}", reason);
    }
    if let Some(err) = &diagnostics.embedding_error {
        println!("embedding error: {}", err);
    }
}
