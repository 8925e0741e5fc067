//! Offline embedding provider.
//!
//! [`HashEmbeddingProvider`] hashes character features into a fixed number of
//! buckets and L2-normalizes the result. It needs no network or model files,
//! always returns the same vector for the same text, and shares its
//! dimension with whatever network provider it stands in for. Similar texts
//! share many character trigrams and therefore score high; the scores carry
//! no semantic meaning beyond that.

use std::hash::Hasher;

use async_trait::async_trait;
use twox_hash::XxHash64;

use crate::Embedding;
use crate::error::Result;
use crate::provider::EmbeddingProvider;
use crate::similarity::normalize;

/// Width of the character shingles hashed alongside single characters.
const SHINGLE_WIDTH: usize = 3;

/// Seed for feature hashing. Changing it changes every vector.
const HASH_SEED: u64 = 0;

/// Deterministic, hash-based embedding provider.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    /// Create a provider producing vectors of `dimension` components.
    ///
    /// A zero dimension is bumped to one so every vector has a component.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed `text` synchronously.
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let codes: Vec<u32> = text.chars().map(u32::from).collect();

        for code in &codes {
            self.accumulate(&mut vector, std::slice::from_ref(code));
        }
        for window in codes.windows(SHINGLE_WIDTH) {
            self.accumulate(&mut vector, window);
        }

        normalize(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u32]) {
        let mut hasher = XxHash64::with_seed(HASH_SEED);
        hasher.write_usize(feature.len());
        for code in feature {
            hasher.write_u32(*code);
        }
        let hash = hasher.finish();

        let bucket = (hash % self.dimension as u64) as usize;
        // The top bit picks the sign so colliding features partly cancel.
        let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
        vector[bucket] += sign;
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        "char-shingle-hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }

    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_text(text))
    }
}
