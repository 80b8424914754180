use std::sync::Arc;

use crate::cancel::CancelFlag;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::types::{
    Chunk, ChunkId, CompactionReport, Embedding, IndexEntry, IndexKind, IndexStats, SearchHit, SparseTerms, Version,
};

/// Produces the dense and sparse representation of a piece of text.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;
    fn dim(&self) -> usize;
    /// Largest input, in whitespace tokens, the backend accepts.
    fn max_tokens(&self) -> usize;
    fn embed_dense(&self, text: &str) -> Result<Vec<f32>>;
    fn embed_sparse(&self, text: &str) -> Result<SparseTerms>;

    fn embed(&self, chunk: &Chunk) -> Result<Embedding> {
        Ok(Embedding {
            chunk_id: chunk.id.clone(),
            dense: self.embed_dense(&chunk.text)?,
            sparse: self.embed_sparse(&chunk.text)?,
        })
    }
}

/// Rejects input the encoder cannot represent.
pub fn check_encodable(text: &str, max_tokens: usize) -> Result<usize> {
    let tokens = text.split_whitespace().count();
    if tokens == 0 {
        return Err(Error::encoding("cannot encode empty text"));
    }
    if tokens > max_tokens {
        return Err(Error::encoding(format!("text has {tokens} tokens, encoder accepts at most {max_tokens}")));
    }
    Ok(tokens)
}

/// What a single sub-search may see.
#[derive(Debug, Clone, Copy)]
pub struct SearchScope<'a> {
    /// Pinned commit epoch.
    pub at: Version,
    pub filter: Option<&'a Filter>,
    pub cancel: &'a CancelFlag,
}

impl<'a> SearchScope<'a> {
    pub fn admits(&self, chunk: &Chunk) -> bool {
        self.filter.map_or(true, |f| f.matches(chunk))
    }
}

/// Versioned storage operations shared by both index kinds.
///
/// Writes are tagged with the unpublished version the manager is building;
/// nothing tagged with it is visible to readers pinned at an older epoch.
pub trait IndexMaintenance: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Tombstone the live entry for `id`. Returns false when there is none.
    fn delete(&self, id: &str, version: Version) -> Result<bool>;

    /// Undo every change tagged with `version`.
    fn abort(&self, version: Version) -> Result<()>;

    /// Drop entries no reader at or after `horizon` can see and rebuild
    /// internal structures.
    fn compact(&self, horizon: Version) -> Result<CompactionReport>;

    fn stats(&self, at: Version) -> Result<IndexStats>;

    fn count(&self, at: Version) -> Result<usize> {
        Ok(self.stats(at)?.live)
    }

    /// Latest entry for `id` created at or before `at`.
    fn entry_state(&self, id: &str, at: Version) -> Result<Option<IndexEntry>>;

    /// Ids of live entries whose chunk matches `filter`.
    fn matching_ids(&self, filter: &Filter, at: Version) -> Result<Vec<ChunkId>>;

    /// Every entry visible at `at`, sorted by chunk id.
    fn live_entries(&self, at: Version) -> Result<Vec<IndexEntry>>;
}

pub trait VectorIndexer: IndexMaintenance {
    fn dim(&self) -> usize;
    fn upsert(&self, chunk: Arc<Chunk>, vector: &[f32], version: Version) -> Result<()>;
    /// Best `k` live entries by cosine similarity, highest first.
    fn search_vec(&self, query: &[f32], k: usize, scope: &SearchScope<'_>) -> Result<Vec<SearchHit>>;
}

pub trait TextIndexer: IndexMaintenance {
    fn upsert(&self, chunk: Arc<Chunk>, terms: &SparseTerms, version: Version) -> Result<()>;
    /// Best `k` live entries by BM25, highest first.
    fn search(&self, terms: &SparseTerms, k: usize, scope: &SearchScope<'_>) -> Result<Vec<SearchHit>>;
}
