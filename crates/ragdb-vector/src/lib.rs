//! ragdb-vector
//!
//! In-memory dense ANN index: cosine similarity over unit vectors with an
//! HNSW graph rebuilt at compaction time.
#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod dense;
pub mod graph;

pub use dense::{DenseConfig, DenseIndex};
pub use graph::AnnGraph;
