use ragdb_core::error::Result;
use ragdb_core::traits::{check_encodable, Encoder};
use ragdb_core::types::SparseTerms;
use ragdb_text::Analyzer;

use crate::hashing::hashed_vector;

/// Lexical encoder: analyzed term frequencies for the sparse side and a
/// feature-hashed vector over the same terms for the dense side.
pub struct AnalyzerEncoder {
    analyzer: Analyzer,
    dim: usize,
    max_tokens: usize,
}

impl AnalyzerEncoder {
    pub fn new(dim: usize, max_tokens: usize) -> Self {
        Self { analyzer: Analyzer::english(), dim: dim.max(1), max_tokens }
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    fn dense_terms(&self, text: &str) -> SparseTerms {
        let terms = self.analyzer.term_frequencies(text);
        if !terms.is_empty() {
            return terms;
        }
        // Stop words only: hash the raw lower-cased words so the vector is never zero.
        let mut raw = SparseTerms::new();
        for word in text.split_whitespace() {
            *raw.entry(word.to_lowercase()).or_insert(0.0) += 1.0;
        }
        raw
    }
}

impl Encoder for AnalyzerEncoder {
    fn name(&self) -> &str {
        "analyzer"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn embed_dense(&self, text: &str) -> Result<Vec<f32>> {
        check_encodable(text, self.max_tokens)?;
        Ok(hashed_vector(&self.dense_terms(text), self.dim))
    }

    fn embed_sparse(&self, text: &str) -> Result<SparseTerms> {
        check_encodable(text, self.max_tokens)?;
        Ok(self.analyzer.term_frequencies(text))
    }
}
