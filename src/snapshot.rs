//! On-disk snapshot of the vector index.
//!
//! A snapshot directory holds one file, `index.snap`:
//!
//! | Section | Contents |
//! |---------|----------|
//! | Header | `SPVX`, version, dims, slot count, metadata length |
//! | Vectors | Every slot's vector as little-endian `f32`, in slot order |
//! | Metadata | JSON: per-slot chunk metadata and tombstone flags, same order |
//!
//! The vector section is the index structure; the metadata section maps
//! slots back to chunks. The whole file is written to a temp file and
//! renamed into place, so a reader sees either the previous snapshot or
//! the new one. A damaged metadata section with an intact vector section
//! is reported separately so the loader can salvage the vectors.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use specter_rag_core::embedding::{blob_to_vec, vec_to_blob};
use specter_rag_core::index::memory::Slot;
use specter_rag_core::index::Metric;
use specter_rag_core::models::DocumentChunk;

const MAGIC: &[u8; 4] = b"SPVX";
const VERSION: u32 = 2;
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 8;

pub const SNAPSHOT_FILE: &str = "index.snap";

/// Snapshot read/write failure.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed vector section: {0}")]
    Format(String),

    #[error("malformed metadata: {0}")]
    Metadata(String),
}

impl SnapshotError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A snapshot whose header and vector section checked out. The metadata
/// section is only decoded by [`SnapshotFile::slots`].
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotFile {
    pub dims: usize,
    pub vectors: Vec<Vec<f32>>,
    metadata: Vec<u8>,
    metadata_len: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    dims: usize,
    metric: Metric,
    slots: Vec<SlotMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotMeta {
    #[serde(flatten)]
    chunk: DocumentChunk,
    deleted: bool,
}

pub fn path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE)
}

/// Whether a snapshot exists under `dir`.
pub fn exists(dir: &Path) -> bool {
    path(dir).exists()
}

/// Replace the snapshot under `dir` with `slots`.
pub fn write(dir: &Path, dims: usize, metric: Metric, slots: &[Slot]) -> Result<(), SnapshotError> {
    fs::create_dir_all(dir).map_err(|e| SnapshotError::io(dir, e))?;

    let meta = Metadata {
        dims,
        metric,
        slots: slots
            .iter()
            .map(|s| SlotMeta {
                chunk: s.chunk.clone(),
                deleted: s.deleted,
            })
            .collect(),
    };
    let json = serde_json::to_vec(&meta).map_err(|e| SnapshotError::Metadata(e.to_string()))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + slots.len() * dims * 4 + json.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&VERSION.to_le_bytes());
    blob.extend_from_slice(&(dims as u32).to_le_bytes());
    blob.extend_from_slice(&(slots.len() as u64).to_le_bytes());
    blob.extend_from_slice(&(json.len() as u64).to_le_bytes());
    for slot in slots {
        blob.extend_from_slice(&vec_to_blob(&slot.chunk.vector));
    }
    blob.extend_from_slice(&json);
    write_atomic(&path(dir), &blob)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| SnapshotError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| SnapshotError::io(&tmp, e))?;
    file.sync_all().map_err(|e| SnapshotError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| SnapshotError::io(path, e))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Read the snapshot and validate its header and vector section.
pub fn read(dir: &Path) -> Result<SnapshotFile, SnapshotError> {
    let path = path(dir);
    let mut bytes = fs::read(&path).map_err(|e| SnapshotError::io(&path, e))?;
    if bytes.len() < HEADER_LEN {
        return Err(SnapshotError::Format("file shorter than header".to_string()));
    }
    if &bytes[..4] != MAGIC {
        return Err(SnapshotError::Format("bad magic".to_string()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(SnapshotError::Format(format!("unsupported version {version}")));
    }
    let dims = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let count = read_u64(&bytes[12..20]) as usize;
    let metadata_len = read_u64(&bytes[20..28]) as usize;

    let vector_bytes = count
        .checked_mul(dims)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| SnapshotError::Format("header overflows".to_string()))?;
    let body = bytes.len() - HEADER_LEN;
    if dims == 0 || body < vector_bytes {
        return Err(SnapshotError::Format(format!(
            "expected {} vector bytes for {} x {}, found {}",
            vector_bytes, count, dims, body
        )));
    }

    let metadata = bytes.split_off(HEADER_LEN + vector_bytes);
    let vectors = bytes[HEADER_LEN..].chunks_exact(dims * 4).map(blob_to_vec).collect();
    Ok(SnapshotFile {
        dims,
        vectors,
        metadata,
        metadata_len,
    })
}

impl SnapshotFile {
    /// Decode the metadata section and zip it with the vectors into slots.
    ///
    /// Fails when the metadata is truncated or unreadable, disagrees with
    /// the vector section, or names the same chunk twice.
    pub fn slots(&self) -> Result<(Metric, Vec<Slot>), SnapshotError> {
        if self.metadata.len() != self.metadata_len {
            return Err(SnapshotError::Metadata(format!(
                "expected {} metadata bytes, found {}",
                self.metadata_len,
                self.metadata.len()
            )));
        }
        let meta: Metadata =
            serde_json::from_slice(&self.metadata).map_err(|e| SnapshotError::Metadata(e.to_string()))?;

        if meta.dims != self.dims {
            return Err(SnapshotError::Metadata(format!(
                "metadata dims {} disagree with vector dims {}",
                meta.dims, self.dims
            )));
        }
        if meta.slots.len() != self.vectors.len() {
            return Err(SnapshotError::Metadata(format!(
                "{} metadata entries for {} vectors",
                meta.slots.len(),
                self.vectors.len()
            )));
        }

        let mut seen = std::collections::HashSet::with_capacity(meta.slots.len());
        let mut slots = Vec::with_capacity(meta.slots.len());
        for (entry, vector) in meta.slots.into_iter().zip(self.vectors.iter()) {
            if !seen.insert(entry.chunk.chunk_id.clone()) {
                return Err(SnapshotError::Metadata(format!(
                    "duplicate chunk id {}",
                    entry.chunk.chunk_id
                )));
            }
            let mut chunk = entry.chunk;
            chunk.vector = vector.clone();
            slots.push(Slot {
                chunk,
                deleted: entry.deleted,
            });
        }
        Ok((meta.metric, slots))
    }
}
