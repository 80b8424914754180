//! ragdb-hybrid
//!
//! Hybrid retrieval over the dense and sparse indices: versioned writes that
//! stay consistent across both, parallel sub-searches at a pinned epoch and
//! Reciprocal Rank Fusion of the two rankings.
#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

use std::sync::Arc;
use tracing::info;

use ragdb_core::chunker::Chunker;
use ragdb_core::config::Settings;
use ragdb_core::error::Result;
use ragdb_core::traits::{Encoder, TextIndexer, VectorIndexer};
use ragdb_core::types::{CompactionReport, IngestRecord};
use ragdb_text::SparseIndex;
use ragdb_vector::{DenseConfig, DenseIndex};

pub mod clock;
pub mod fusion;
pub mod ingest;
pub mod manager;
pub mod planner;
pub mod retry;

pub use clock::{EpochClock, ReadPin};
pub use fusion::{fuse, RankedList, RrfConfig};
pub use ingest::{IngestPipeline, IngestReport};
pub use manager::{CommitReport, EngineStats, HybridIndex, IntegrityReport, ManagerConfig, PreparedChunk, WriteBatch};
pub use planner::{Degradation, ExecutorConfig, HybridHit, QueryExecutor, QueryPlan, QueryPlanner, QueryRequest, QueryResponse};
pub use retry::RetryPolicy;

/// Ingestion, querying and maintenance over one pair of indices.
pub struct HybridSearchEngine<D = DenseIndex, S = SparseIndex> {
    index: Arc<HybridIndex<D, S>>,
    planner: QueryPlanner,
    executor: QueryExecutor<D, S>,
    pipeline: IngestPipeline<D, S>,
}

impl HybridSearchEngine {
    /// In-memory engine with the encoder chosen by `settings.encoder`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let encoder = ragdb_embed::get_default_encoder(&settings.encoder)?;
        Self::with_encoder(settings, encoder)
    }

    pub fn with_encoder(settings: &Settings, encoder: Arc<dyn Encoder>) -> Result<Self> {
        settings.validate()?;
        let dense = DenseIndex::new(DenseConfig::from_index_config(encoder.dim(), &settings.index));
        let sparse = SparseIndex::in_memory()?;
        Self::with_indices(settings, encoder, dense, sparse)
    }
}

impl<D, S> HybridSearchEngine<D, S>
where
    D: VectorIndexer + 'static,
    S: TextIndexer + 'static,
{
    pub fn with_indices(settings: &Settings, encoder: Arc<dyn Encoder>, dense: D, sparse: S) -> Result<Self> {
        let index = Arc::new(HybridIndex::new(dense, sparse, ManagerConfig::from(settings)));
        let chunker = Chunker::new(settings.chunking)?;
        let pipeline = IngestPipeline::new(chunker, Arc::clone(&encoder), Arc::clone(&index))?;
        let planner = QueryPlanner::new(Arc::clone(&encoder), settings.query.clone());
        let executor = QueryExecutor::new(
            Arc::clone(&index),
            ExecutorConfig::from_query_config(&settings.query, RetryPolicy::from(&settings.retry)),
        );
        info!(
            encoder = encoder.name(),
            dim = encoder.dim(),
            max_chunk_tokens = settings.chunking.max_chunk_tokens,
            policy = ?settings.query.partial_failure,
            "hybrid engine ready"
        );
        Ok(Self { index, planner, executor, pipeline })
    }

    pub fn index(&self) -> &Arc<HybridIndex<D, S>> {
        &self.index
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    pub fn ingest(&self, record: &IngestRecord) -> Result<IngestReport> {
        self.pipeline.ingest(record)
    }

    pub fn ingest_many<'a, I>(&self, records: I) -> Result<Vec<IngestReport>>
    where
        I: IntoIterator<Item = &'a IngestRecord>,
    {
        self.pipeline.ingest_many(records)
    }

    pub fn remove_document(&self, doc_id: &str) -> Result<usize> {
        self.pipeline.remove_document(doc_id)
    }

    pub fn plan(&self, request: &QueryRequest) -> Result<QueryPlan> {
        self.planner.plan(request)
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let plan = self.planner.plan(request)?;
        self.executor.execute(plan).await
    }

    pub fn stats(&self) -> Result<EngineStats> {
        self.index.stats()
    }

    pub fn compact_all(&self) -> Result<Vec<CompactionReport>> {
        self.index.compact_all()
    }
}
