//! Domain types shared by the dense and sparse engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub type ChunkId = String;
pub type Meta = HashMap<String, String>;

/// Commit epoch. Every write batch the manager publishes gets the next one.
pub type Version = u64;

/// Sparse representation: analyzed term -> weight. Ordered so that encoders
/// and indices iterate terms deterministically.
pub type SparseTerms = BTreeMap<String, f32>;

/// A chunk of a source document that is independently indexed.
///
/// - `id`: globally unique chunk identifier, shared by both indices
/// - `source_doc_id`: stable document identity supplied by the producer
/// - `text`: the exact byte range `byte_start..byte_end` of the source
/// - `overlap_bytes`: length of the prefix of `text` repeated from the
///   previous chunk; dropping it from every chunk and concatenating gives the
///   source back
/// - `chunk_index`/`total_chunks`: position within the parent document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub source_doc_id: String,
    pub text: String,
    pub token_count: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub overlap_bytes: usize,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub citation_url: String,
    pub metadata: Meta,
    pub content_hash: String,
}

impl Chunk {
    /// The part of `text` that is not repeated from the previous chunk.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap_bytes..]
    }
}

pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Record handed over by the ingestion producer.
///
/// `structural_hints` are byte offsets of known structural boundaries (for
/// example section starts found by an upstream parser); they are snapped to
/// the start of the enclosing line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub doc_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Meta,
    #[serde(default)]
    pub structural_hints: Vec<usize>,
    #[serde(default)]
    pub citation_url: Option<String>,
}

impl IngestRecord {
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { doc_id: doc_id.into(), text: text.into(), ..Self::default() }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_citation_url(mut self, url: impl Into<String>) -> Self {
        self.citation_url = Some(url.into());
        self
    }

    pub fn with_hints(mut self, hints: Vec<usize>) -> Self {
        self.structural_hints = hints;
        self
    }

    /// Explicit citation url, then a `citation_url` metadata field, then the doc id.
    pub fn resolved_citation_url(&self) -> String {
        self.citation_url
            .clone()
            .or_else(|| self.metadata.get("citation_url").cloned())
            .unwrap_or_else(|| self.doc_id.clone())
    }
}

/// Dense + sparse representation of one chunk, computed once at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: ChunkId,
    pub dense: Vec<f32>,
    pub sparse: SparseTerms,
}

/// Indicates which index produced or holds an entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Dense,
    Sparse,
}

impl IndexKind {
    pub const ALL: [IndexKind; 2] = [IndexKind::Dense, IndexKind::Sparse];

    pub fn other(self) -> Self {
        match self {
            IndexKind::Dense => IndexKind::Sparse,
            IndexKind::Sparse => IndexKind::Dense,
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Dense => f.write_str("dense"),
            IndexKind::Sparse => f.write_str("sparse"),
        }
    }
}

/// Physical lifetime of an index entry in commit epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifespan {
    pub created: Version,
    pub deleted: Option<Version>,
}

impl Lifespan {
    pub fn new(created: Version) -> Self {
        Self { created, deleted: None }
    }

    pub fn visible_at(&self, epoch: Version) -> bool {
        self.created <= epoch && self.deleted.map_or(true, |d| d > epoch)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted.is_some()
    }

    /// Created and deleted by the same version, so never visible to anyone.
    pub fn is_aborted(&self) -> bool {
        self.deleted == Some(self.created)
    }

    /// Compaction may drop the entry once no reader pinned at or after
    /// `horizon` can see it any more.
    pub fn reclaimable(&self, horizon: Version) -> bool {
        self.deleted.is_some_and(|d| d <= horizon)
    }
}

/// Logical view of one entry in one index, as reported by `entry_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: ChunkId,
    pub index_kind: IndexKind,
    pub version: Version,
    pub tombstoned: bool,
    pub metadata: Meta,
}

/// Raw hit of one index before ranks are assigned.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Arc<Chunk>,
    pub score: f32,
    pub version: Version,
}

/// Keep the best `k` hits: score descending, chunk id ascending on ties.
pub fn top_k(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk.id.cmp(&b.chunk.id)));
    hits.truncate(k);
    hits
}

/// One ranked hit of a single sub-search. Ranks start at 1.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub chunk_id: ChunkId,
    pub rank: usize,
    pub raw_score: f32,
    pub source_index: IndexKind,
    pub version: Version,
    #[serde(skip)]
    pub chunk: Arc<Chunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributingRank {
    pub source: IndexKind,
    pub rank: usize,
}

/// Output of rank fusion. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub chunk_id: ChunkId,
    pub combined_score: f64,
    pub contributing_ranks: Vec<ContributingRank>,
}

impl FusedResult {
    pub fn min_rank(&self) -> usize {
        self.contributing_ranks.iter().map(|r| r.rank).min().unwrap_or(usize::MAX)
    }

    pub fn rank_in(&self, source: IndexKind) -> Option<usize> {
        self.contributing_ranks.iter().find(|r| r.source == source).map(|r| r.rank)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub live: usize,
    pub tombstoned: usize,
    pub physical: usize,
    pub graph_size: usize,
    pub last_compaction: Option<DateTime<Utc>>,
}

impl IndexStats {
    pub fn tombstone_ratio(&self) -> f32 {
        if self.physical == 0 {
            return 0.0;
        }
        self.tombstoned as f32 / self.physical as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStatus {
    Completed,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    pub kind: IndexKind,
    pub status: CompactionStatus,
    pub reclaimed: usize,
    pub retained: usize,
    pub horizon: Version,
}

impl CompactionReport {
    pub fn already_running(kind: IndexKind, horizon: Version) -> Self {
        Self { kind, status: CompactionStatus::AlreadyRunning, reclaimed: 0, retained: 0, horizon }
    }
}
