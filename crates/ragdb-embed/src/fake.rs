use ragdb_core::error::Result;
use ragdb_core::traits::{check_encodable, Encoder};
use ragdb_core::types::SparseTerms;

use crate::hashing::{bucket, l2_normalize};

/// Deterministic test double: bag-of-words xxHash vectors and lower-cased
/// whitespace term counts. No model files needed.
pub struct FakeEncoder {
    dim: usize,
    max_tokens: usize,
}

impl FakeEncoder {
    pub fn new(dim: usize, max_tokens: usize) -> Self {
        Self { dim: dim.max(1), max_tokens }
    }
}

impl Encoder for FakeEncoder {
    fn name(&self) -> &str {
        "fake"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn embed_dense(&self, text: &str) -> Result<Vec<f32>> {
        check_encodable(text, self.max_tokens)?;
        let mut v = vec![0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let h = bucket(&token.to_lowercase());
            let idx = (h as usize) % self.dim;
            let val = (((h >> 32) as u32) as f32) / (u32::MAX as f32);
            v[idx] += val + (i as f32 % 3.0) * 0.01;
        }
        l2_normalize(&mut v);
        Ok(v)
    }

    fn embed_sparse(&self, text: &str) -> Result<SparseTerms> {
        check_encodable(text, self.max_tokens)?;
        let mut terms = SparseTerms::new();
        for token in text.split_whitespace() {
            let term: String = token.chars().filter(|c| c.is_alphanumeric()).flat_map(char::to_lowercase).collect();
            if !term.is_empty() {
                *terms.entry(term).or_insert(0.0) += 1.0;
            }
        }
        Ok(terms)
    }
}
