//! Index statistics and health overview.
//!
//! A quick summary of what the shared index holds: live and tombstoned
//! chunks, vector dimension, and a per-conversation breakdown. Used by
//! `specter-rag stats` to confirm uploads, removals and promotions landed
//! where expected.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use specter_rag_core::index::{Metric, VectorIndex};

use crate::snapshot;
use crate::store::VectorIndexStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub live: usize,
    pub tombstoned: usize,
    pub dims: usize,
    pub metric: Metric,
    /// Live chunks per resolved owner, sorted by id.
    pub per_owner: BTreeMap<String, usize>,
}

impl IndexStats {
    pub async fn collect(store: &VectorIndexStore) -> Self {
        Self {
            live: store.total_count().await,
            tombstoned: store.tombstone_count(),
            dims: store.dims(),
            metric: store.metric(),
            per_owner: store.owner_counts().await.into_iter().collect(),
        }
    }

    /// Live chunks that resolve to no owner.
    pub fn ownerless(&self) -> usize {
        self.live
            .saturating_sub(self.per_owner.values().sum::<usize>())
    }
}

/// Print a summary of `store` to stdout.
pub async fn run_stats(store: &VectorIndexStore) {
    let stats = IndexStats::collect(store).await;

    println!("Specter RAG — Index Stats");
    println!("=========================");
    println!();
    match store.path() {
        Some(path) => {
            println!("  Snapshot:    {}", path.display());
            println!("  Size:        {}", format_bytes(snapshot_size(path)));
        }
        None => println!("  Snapshot:    (memory only)"),
    }
    println!("  Dimensions:  {}", stats.dims);
    println!("  Metric:      {}", stats.metric);
    println!();
    println!("  Live chunks: {}", stats.live);
    println!(
        "  Tombstoned:  {} ({}% of slots)",
        stats.tombstoned,
        percent(stats.tombstoned, stats.live + stats.tombstoned)
    );
    if stats.ownerless() > 0 {
        println!("  Ownerless:   {}", stats.ownerless());
    }

    if !stats.per_owner.is_empty() {
        println!();
        println!("  By conversation:");
        println!("  {:<40} {:>8}", "CONVERSATION", "CHUNKS");
        println!("  {}", "-".repeat(49));
        for (owner, count) in &stats.per_owner {
            println!("  {:<40} {:>8}", owner, count);
        }
    }

    println!();
}

fn percent(part: usize, whole: usize) -> usize {
    if whole > 0 {
        part * 100 / whole
    } else {
        0
    }
}

fn snapshot_size(dir: &Path) -> u64 {
    std::fs::metadata(snapshot::path(dir))
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specter_rag_core::models::{ChunkOwner, DocumentChunk};

    #[tokio::test]
    async fn test_collect_counts_owners_and_tombstones() {
        let store = VectorIndexStore::in_memory(2, Metric::Cosine);
        for owner in [
            ChunkOwner::Conversation("A".into()),
            ChunkOwner::Conversation("A".into()),
            ChunkOwner::Pending("P".into()),
            ChunkOwner::Conversation("B".into()),
        ] {
            store
                .add(DocumentChunk::new(&owner, "f.txt", "t", vec![1.0, 0.0]))
                .await
                .unwrap();
        }
        store.remove_by_conversation("B").await.unwrap();

        let stats = IndexStats::collect(&store).await;
        assert_eq!(stats.live, 3);
        assert_eq!(stats.tombstoned, 1);
        assert_eq!(stats.dims, 2);
        assert_eq!(stats.per_owner.get("A"), Some(&2));
        assert_eq!(stats.per_owner.get("P"), Some(&1));
        assert_eq!(stats.ownerless(), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(0, 0), 0);
    }
}
