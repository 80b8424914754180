#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ragdb_core::config::{EncoderBackend, PartialFailurePolicy, Settings};
use ragdb_core::error::{Error, Result};
use ragdb_core::filter::Filter;
use ragdb_core::traits::{Encoder, IndexMaintenance, SearchScope, TextIndexer, VectorIndexer};
use ragdb_core::types::{
    Chunk, ChunkId, CompactionReport, IndexEntry, IndexKind, IndexStats, SearchHit, SparseTerms, Version,
};
use ragdb_embed::FakeEncoder;
use ragdb_hybrid::{HybridSearchEngine, PreparedChunk};
use ragdb_text::SparseIndex;
use ragdb_vector::{DenseConfig, DenseIndex};

pub const DIM: usize = 64;

pub fn settings(policy: PartialFailurePolicy) -> Settings {
    let mut s = Settings::default();
    s.encoder.backend = EncoderBackend::Fake;
    s.encoder.dim = DIM;
    s.chunking.max_chunk_tokens = 32;
    s.chunking.overlap_tokens = 4;
    s.retry.max_attempts = 3;
    s.retry.initial_backoff_ms = 1;
    s.retry.max_backoff_ms = 2;
    s.query.partial_failure = policy;
    s.query.sub_search_timeout_ms = 2_000;
    s
}

pub fn encoder() -> Arc<dyn Encoder> {
    Arc::new(FakeEncoder::new(DIM, 512))
}

pub fn chunk(doc: &str, id: &str, text: &str) -> Chunk {
    Chunk {
        id: id.into(),
        source_doc_id: doc.into(),
        text: text.into(),
        token_count: text.split_whitespace().count(),
        byte_start: 0,
        byte_end: text.len(),
        overlap_bytes: 0,
        chunk_index: 0,
        total_chunks: 1,
        citation_url: format!("https://docs.example.org/{doc}"),
        metadata: Default::default(),
        content_hash: ragdb_core::types::content_hash(text),
    }
}

pub fn prepared(doc: &str, id: &str, text: &str) -> PreparedChunk {
    let chunk = chunk(doc, id, text);
    let embedding = encoder().embed(&chunk).expect("fake encoder");
    PreparedChunk::new(chunk, embedding)
}

/// Wraps a real index and injects failures, latency and cancellation checks.
pub struct Faulty<I> {
    pub inner: I,
    /// Upserts still to fail with `IndexUnavailable`.
    pub failing_upserts: AtomicUsize,
    pub failing_searches: AtomicBool,
    pub search_delay: Mutex<Duration>,
    pub observed_cancel: AtomicBool,
    pub searches: AtomicUsize,
}

impl<I> Faulty<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            failing_upserts: AtomicUsize::new(0),
            failing_searches: AtomicBool::new(false),
            search_delay: Mutex::new(Duration::ZERO),
            observed_cancel: AtomicBool::new(false),
            searches: AtomicUsize::new(0),
        }
    }

    pub fn fail_upserts(&self, n: usize) {
        self.failing_upserts.store(n, Ordering::SeqCst);
    }

    pub fn fail_searches(&self, on: bool) {
        self.failing_searches.store(on, Ordering::SeqCst);
    }

    pub fn delay_searches(&self, d: Duration) {
        *self.search_delay.lock().unwrap() = d;
    }

    pub fn saw_cancel(&self) -> bool {
        self.observed_cancel.load(Ordering::SeqCst)
    }

    fn kind_hint(&self) -> IndexKind
    where
        I: IndexMaintenance,
    {
        IndexMaintenance::kind(&self.inner)
    }

    fn before_upsert(&self) -> Result<()>
    where
        I: IndexMaintenance,
    {
        let left = self.failing_upserts.load(Ordering::SeqCst);
        if left > 0 {
            self.failing_upserts.store(left - 1, Ordering::SeqCst);
            return Err(Error::unavailable(self.kind_hint(), "injected upsert failure"));
        }
        Ok(())
    }

    fn before_search(&self, scope: &SearchScope<'_>) -> Result<()>
    where
        I: IndexMaintenance,
    {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.failing_searches.load(Ordering::SeqCst) {
            return Err(Error::unavailable(self.kind_hint(), "injected search failure"));
        }
        let delay = *self.search_delay.lock().unwrap();
        let started = Instant::now();
        while started.elapsed() < delay {
            if scope.cancel.is_cancelled() {
                self.observed_cancel.store(true, Ordering::SeqCst);
                return Err(Error::Cancelled);
            }
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }
}

impl<I: IndexMaintenance> IndexMaintenance for Faulty<I> {
    fn kind(&self) -> IndexKind {
        self.inner.kind()
    }
    fn delete(&self, id: &str, version: Version) -> Result<bool> {
        self.inner.delete(id, version)
    }
    fn abort(&self, version: Version) -> Result<()> {
        self.inner.abort(version)
    }
    fn compact(&self, horizon: Version) -> Result<CompactionReport> {
        self.inner.compact(horizon)
    }
    fn stats(&self, at: Version) -> Result<IndexStats> {
        self.inner.stats(at)
    }
    fn entry_state(&self, id: &str, at: Version) -> Result<Option<IndexEntry>> {
        self.inner.entry_state(id, at)
    }
    fn matching_ids(&self, filter: &Filter, at: Version) -> Result<Vec<ChunkId>> {
        self.inner.matching_ids(filter, at)
    }
    fn live_entries(&self, at: Version) -> Result<Vec<IndexEntry>> {
        self.inner.live_entries(at)
    }
}

impl VectorIndexer for Faulty<DenseIndex> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }
    fn upsert(&self, chunk: Arc<Chunk>, vector: &[f32], version: Version) -> Result<()> {
        self.before_upsert()?;
        self.inner.upsert(chunk, vector, version)
    }
    fn search_vec(&self, query: &[f32], k: usize, scope: &SearchScope<'_>) -> Result<Vec<SearchHit>> {
        self.before_search(scope)?;
        self.inner.search_vec(query, k, scope)
    }
}

impl TextIndexer for Faulty<SparseIndex> {
    fn upsert(&self, chunk: Arc<Chunk>, terms: &SparseTerms, version: Version) -> Result<()> {
        self.before_upsert()?;
        self.inner.upsert(chunk, terms, version)
    }
    fn search(&self, terms: &SparseTerms, k: usize, scope: &SearchScope<'_>) -> Result<Vec<SearchHit>> {
        self.before_search(scope)?;
        self.inner.search(terms, k, scope)
    }
}

pub type TestEngine = HybridSearchEngine<Faulty<DenseIndex>, Faulty<SparseIndex>>;

pub fn engine(settings: &Settings) -> TestEngine {
    let dense = Faulty::new(DenseIndex::new(DenseConfig::from_index_config(DIM, &settings.index)));
    let sparse = Faulty::new(SparseIndex::in_memory().unwrap());
    HybridSearchEngine::with_indices(settings, encoder(), dense, sparse).expect("engine")
}

/// Poll `cond` for up to two seconds.
pub fn eventually(cond: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(2) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
