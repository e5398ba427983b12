//! Text vectorization via the hashing trick (TF-IDF over hashed buckets).
//!
//! No model download, no randomness: the same text and the same vocabulary
//! statistics always produce a bit-identical vector.

use crate::tokenize::Tokenizer;

/// Source of inverse-document-frequency weights
pub trait TermWeights {
    fn idf(&self, term: &str) -> f32;
}

/// Every term weighs 1.0 (plain term frequency)
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeights;

impl TermWeights for UniformWeights {
    fn idf(&self, _term: &str) -> f32 {
        1.0
    }
}

/// Maps text to a fixed-length, L2-normalized vector
#[derive(Debug, Clone)]
pub struct Vectorizer {
    dimensions: usize,
    tokenizer: Tokenizer,
}

impl Vectorizer {
    pub fn new(dimensions: usize, tokenizer: Tokenizer) -> Self {
        Self {
            dimensions: dimensions.max(1),
            tokenizer,
        }
    }

    /// Get the vector dimensions
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Bucket a token lands in
    pub fn bucket(&self, token: &str) -> usize {
        (fnv1a_hash(token.as_bytes()) % self.dimensions as u64) as usize
    }

    /// Vectorize `text`. Text without indexable tokens yields the zero vector.
    pub fn vectorize(&self, text: &str, weights: &dyn TermWeights) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        // Summing idf once per occurrence accumulates tf * idf per bucket;
        // colliding terms share a bucket.
        for token in self.tokenizer.tokenize(text) {
            let index = self.bucket(&token);
            vector[index] += weights.idf(&token);
        }

        normalize(&mut vector);
        vector
    }
}

/// Scale to unit length in place; the zero vector is left alone
pub fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|c| c * c).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for component in vector.iter_mut() {
            *component /= magnitude;
        }
    }
}

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
