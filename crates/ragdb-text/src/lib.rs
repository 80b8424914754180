//! ragdb-text
//!
//! Term analysis (tantivy tokenizer pipeline) and the BM25 sparse index
//! backed by an in-memory tantivy index.
#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod analyzer;
pub mod sparse;

pub use analyzer::Analyzer;
pub use sparse::SparseIndex;
