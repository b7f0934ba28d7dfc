//! Offline feature-hashing embedder.
//!
//! Each lower-cased alphanumeric token is hashed with SHA-256 into one of
//! `dims` buckets with a hash-derived sign, and the result is L2-normalised.
//! It needs no model download and is fully deterministic, which makes it
//! the default provider and the one used in tests. Texts sharing words get
//! positive cosine similarity; it captures no semantics beyond that.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use specter_rag_core::embedding::{ensure_embeddable, l2_normalize, Embedder, EmbeddingError};

pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model: format!("sha256-hash-{}", dims.max(1)),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        ensure_embeddable(text)?;
        Ok(self.embed_sync(text))
    }
}
