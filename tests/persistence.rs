//! Integration tests for the persisted store, the CLI-facing config path,
//! and the blocking session wrapper.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use specter_rag::blocking;
use specter_rag::config::parse_config;
use specter_rag::embedding::create_embedder;
use specter_rag::ingest::Ingestor;
use specter_rag::models::ChunkOwner;
use specter_rag::session::RetrievalSession;
use specter_rag::snapshot;
use specter_rag::stats::IndexStats;
use specter_rag::store::{LoadOutcome, VectorIndexStore};
use specter_rag_core::index::VectorIndex;
use tempfile::TempDir;

fn config_for(dir: &std::path::Path) -> specter_rag::config::Config {
    parse_config(&format!(
        r#"
[index]
path = "{}"

[embedding]
provider = "hash"
dims = 64
"#,
        dir.display()
    ))
    .unwrap()
}

struct Stack {
    store: Arc<VectorIndexStore>,
    session: Arc<RetrievalSession>,
    ingestor: Ingestor,
}

fn open(cfg: &specter_rag::config::Config) -> Stack {
    let embedder = create_embedder(&cfg.embedding).unwrap();
    let store = Arc::new(VectorIndexStore::from_config(&cfg.index, embedder.dims()));
    let session = Arc::new(RetrievalSession::new(
        store.clone(),
        embedder.clone(),
        &cfg.retrieval,
    ));
    let ingestor = Ingestor::new(store.clone(), embedder, session.clone(), cfg);
    Stack {
        store,
        session,
        ingestor,
    }
}

#[tokio::test]
async fn test_uploads_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_for(&tmp.path().join("index"));

    {
        let stack = open(&cfg);
        assert_eq!(stack.store.load_outcome(), &LoadOutcome::Fresh);
        stack
            .ingestor
            .ingest_text(&ChunkOwner::Pending("P".into()), "plan.md", "Roadmap for Q3")
            .await
            .unwrap();
        stack
            .ingestor
            .ingest_text(&ChunkOwner::Conversation("B".into()), "other.md", "Roadmap for Q4")
            .await
            .unwrap();
        stack.ingestor.promote_pending("P", "A").await.unwrap();
        stack.ingestor.remove_conversation("B").await.unwrap();
    }

    let stack = open(&cfg);
    assert!(matches!(stack.store.load_outcome(), LoadOutcome::Restored { slots: 2 }));
    assert_eq!(stack.session.resync().await, 1);
    assert_eq!(stack.session.cached_count("A"), Some(1));

    let result = stack.session.query(Some("A"), "roadmap", 5).await.unwrap();
    assert_eq!(result.snippets(), vec!["Roadmap for Q3"]);
    assert!(stack.session.query(Some("B"), "roadmap", 5).await.unwrap().is_empty());
    assert!(stack.session.query(Some("P"), "roadmap", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_compact_reclaims_tombstones_on_disk() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_for(tmp.path());

    let stack = open(&cfg);
    for owner in ["A", "B", "B"] {
        stack
            .ingestor
            .ingest_text(&ChunkOwner::Conversation(owner.into()), "f.txt", &format!("text for {owner}"))
            .await
            .unwrap();
    }
    stack.ingestor.remove_conversation("B").await.unwrap();
    assert_eq!(stack.store.tombstone_count(), 2);

    assert_eq!(stack.store.compact().await.unwrap(), 2);
    drop(stack);

    let stack = open(&cfg);
    assert_eq!(stack.store.slot_count(), 1);
    let stats = IndexStats::collect(&stack.store).await;
    assert_eq!(stats.live, 1);
    assert_eq!(stats.tombstoned, 0);
    assert_eq!(stats.per_owner.get("A"), Some(&1));
}

#[tokio::test]
async fn test_corrupt_metadata_hides_everything() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_for(tmp.path());

    {
        let stack = open(&cfg);
        stack
            .ingestor
            .ingest_text(&ChunkOwner::Conversation("A".into()), "a.md", "private notes")
            .await
            .unwrap();
    }
    // Cut into the metadata section at the end of the snapshot.
    let path = snapshot::path(tmp.path());
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

    let stack = open(&cfg);
    assert!(matches!(stack.store.load_outcome(), LoadOutcome::Salvaged { orphaned: 1, .. }));
    assert_eq!(stack.store.total_count().await, 0);
    assert!(stack.session.query(Some("A"), "private notes", 5).await.unwrap().is_empty());
}

#[test]
fn test_blocking_session_queries_without_async_caller() {
    let cfg = parse_config("[embedding]\ndims = 32\n").unwrap();
    let embedder = create_embedder(&cfg.embedding).unwrap();
    let store = Arc::new(VectorIndexStore::from_config(&cfg.index, embedder.dims()));
    let session = Arc::new(RetrievalSession::new(
        store.clone(),
        embedder.clone(),
        &cfg.retrieval,
    ));
    let ingestor = Ingestor::new(store, embedder, session.clone(), &cfg);

    let sync = blocking::RetrievalSession::new(session).unwrap();
    sync.mark_empty("A");
    assert!(sync.query(Some("A"), "anything", 3).unwrap().is_empty());

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime
        .block_on(ingestor.ingest_text(&ChunkOwner::Conversation("A".into()), "a.txt", "hello world"))
        .unwrap();
    assert_eq!(sync.cached_count("A"), Some(1));

    let outcome = sync.query_with_diagnostics(Some("A"), "hello", 3).unwrap();
    assert!(!outcome.fast_path);
    assert_eq!(outcome.result.snippets(), vec!["hello world"]);
    assert_eq!(sync.resync(), 1);

    let err = sync
        .query_within(Some("A"), "hello", 3, Duration::ZERO)
        .unwrap_err();
    assert!(err.is_timeout());
}
