//! Query planning and dual sub-search execution.
//!
//! `QueryPlanner::plan` validates a request and encodes it once;
//! `QueryExecutor::execute` pins an epoch, runs the dense and sparse searches
//! in parallel on the blocking pool, checks that every hit is present in
//! both indices at that epoch and fuses the two rankings.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use ragdb_core::cancel::CancelFlag;
use ragdb_core::config::{PartialFailurePolicy, QueryConfig};
use ragdb_core::error::{Error, Result};
use ragdb_core::filter::Filter;
use ragdb_core::traits::{Encoder, IndexMaintenance, SearchScope, TextIndexer, VectorIndexer};
use ragdb_core::types::{
    Chunk, ChunkId, ContributingRank, FusedResult, IndexKind, Meta, QueryResult, SearchHit, SparseTerms, Version,
};

use crate::fusion::{fuse, RankedList, RrfConfig};
use crate::manager::HybridIndex;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_text: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub overfetch_factor: Option<usize>,
}

impl QueryRequest {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self { query_text: query_text.into(), ..Self::default() }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn filter(mut self, expr: impl Into<String>) -> Self {
        self.filter = Some(expr.into());
        self
    }

    pub fn overfetch(mut self, factor: usize) -> Self {
        self.overfetch_factor = Some(factor);
        self
    }
}

/// A validated, encoded query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub query_text: String,
    pub top_k: usize,
    /// Per-index candidates: `top_k * overfetch_factor`.
    pub fetch_k: usize,
    pub filter: Option<Filter>,
    pub dense_query: Vec<f32>,
    pub sparse_query: SparseTerms,
}

pub struct QueryPlanner {
    encoder: Arc<dyn Encoder>,
    config: QueryConfig,
}

impl QueryPlanner {
    pub fn new(encoder: Arc<dyn Encoder>, config: QueryConfig) -> Self {
        Self { encoder, config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn plan(&self, request: &QueryRequest) -> Result<QueryPlan> {
        let query_text = request.query_text.trim();
        if query_text.is_empty() {
            return Err(Error::validation("query text must not be empty"));
        }
        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(Error::validation(format!("top_k must be within 1..={}, got {top_k}", self.config.max_top_k)));
        }
        let overfetch = request.overfetch_factor.unwrap_or(self.config.overfetch_factor);
        if overfetch == 0 {
            return Err(Error::validation("overfetch_factor must be at least 1"));
        }
        let filter = match request.filter.as_deref().map(str::trim) {
            Some(expr) if !expr.is_empty() => Some(Filter::parse(expr)?),
            _ => None,
        };
        let dense_query = self.encoder.embed_dense(query_text)?;
        let sparse_query = self.encoder.embed_sparse(query_text)?;
        Ok(QueryPlan {
            query_text: query_text.to_string(),
            top_k,
            fetch_k: top_k.saturating_mul(overfetch),
            filter,
            dense_query,
            sparse_query,
        })
    }
}

/// One fused, hydrated hit.
#[derive(Debug, Clone, Serialize)]
pub struct HybridHit {
    pub chunk_id: ChunkId,
    pub combined_score: f64,
    pub text: String,
    pub citation_url: String,
    pub metadata: Meta,
    pub contributing_ranks: Vec<ContributingRank>,
    pub version: Version,
}

/// Marks a response built from one index because the other failed.
#[derive(Debug, Clone, Serialize)]
pub struct Degradation {
    pub failed: IndexKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub hits: Vec<HybridHit>,
    /// Epoch both sub-searches observed.
    pub epoch: Version,
    pub dense_hits: usize,
    pub sparse_hits: usize,
    pub degraded: Option<Degradation>,
}

impl QueryResponse {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub rrf: RrfConfig,
    pub sub_search_timeout: Duration,
    pub partial_failure: PartialFailurePolicy,
    pub retry: RetryPolicy,
}

impl ExecutorConfig {
    pub fn from_query_config(cfg: &QueryConfig, retry: RetryPolicy) -> Self {
        Self {
            rrf: RrfConfig { k: cfg.rrf_k },
            sub_search_timeout: Duration::from_millis(cfg.sub_search_timeout_ms),
            partial_failure: cfg.partial_failure,
            retry,
        }
    }
}

pub struct QueryExecutor<D, S> {
    index: Arc<HybridIndex<D, S>>,
    config: ExecutorConfig,
}

impl<D, S> QueryExecutor<D, S>
where
    D: VectorIndexer + 'static,
    S: TextIndexer + 'static,
{
    pub fn new(index: Arc<HybridIndex<D, S>>, config: ExecutorConfig) -> Self {
        Self { index, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run both sub-searches at one pinned epoch and fuse them.
    ///
    /// Dropping the returned future cancels both sub-searches.
    #[instrument(skip_all, fields(top_k = plan.top_k, fetch_k = plan.fetch_k))]
    pub async fn execute(&self, plan: QueryPlan) -> Result<QueryResponse> {
        let pin = Arc::new(self.index.pin()?);
        let epoch = pin.epoch();
        let plan = Arc::new(plan);
        let dense_cancel = CancelFlag::new();
        let sparse_cancel = CancelFlag::new();
        let dense_guard = dense_cancel.cancel_on_drop();
        let sparse_guard = sparse_cancel.cancel_on_drop();

        let dense = {
            let (index, plan, pin, cancel) = (Arc::clone(self.index.dense()), Arc::clone(&plan), Arc::clone(&pin), dense_cancel.clone());
            let retry = self.config.retry;
            move || {
                let _pin = pin;
                let scope = SearchScope { at: epoch, filter: plan.filter.as_ref(), cancel: &cancel };
                retry.run(IndexKind::Dense, "search", || index.search_vec(&plan.dense_query, plan.fetch_k, &scope))
            }
        };
        let sparse = {
            let (index, plan, pin, cancel) = (Arc::clone(self.index.sparse()), Arc::clone(&plan), Arc::clone(&pin), sparse_cancel.clone());
            let retry = self.config.retry;
            move || {
                let _pin = pin;
                let scope = SearchScope { at: epoch, filter: plan.filter.as_ref(), cancel: &cancel };
                retry.run(IndexKind::Sparse, "search", || index.search(&plan.sparse_query, plan.fetch_k, &scope))
            }
        };

        let timeout = self.config.sub_search_timeout;
        let (dense_res, sparse_res) = futures::future::join(
            sub_search(IndexKind::Dense, timeout, dense_cancel, dense),
            sub_search(IndexKind::Sparse, timeout, sparse_cancel, sparse),
        )
        .await;
        dense_guard.disarm();
        sparse_guard.disarm();

        let (dense_hits, sparse_hits, degraded) = self.settle(dense_res, sparse_res)?;
        let dense_results = ranked(IndexKind::Dense, dense_hits);
        let sparse_results = ranked(IndexKind::Sparse, sparse_hits);

        if degraded.is_none() {
            self.check_presence(&dense_results, self.index.sparse().as_ref(), epoch)?;
            self.check_presence(&sparse_results, self.index.dense().as_ref(), epoch)?;
        }

        let lists = [
            RankedList::from_results(IndexKind::Dense, &dense_results),
            RankedList::from_results(IndexKind::Sparse, &sparse_results),
        ];
        let fused = fuse(&lists, self.config.rrf, plan.top_k);
        let hits = hydrate_all(fused, &dense_results, &sparse_results);

        debug!(epoch, dense = dense_results.len(), sparse = sparse_results.len(), returned = hits.len(), "query executed");
        Ok(QueryResponse { hits, epoch, dense_hits: dense_results.len(), sparse_hits: sparse_results.len(), degraded })
    }

    fn settle(
        &self,
        dense: Result<Vec<SearchHit>>,
        sparse: Result<Vec<SearchHit>>,
    ) -> Result<(Vec<SearchHit>, Vec<SearchHit>, Option<Degradation>)> {
        match (dense, sparse) {
            (Ok(d), Ok(s)) => Ok((d, s, None)),
            (Err(d), Err(s)) => {
                warn!(dense = %d, sparse = %s, "both sub-searches failed");
                // An integrity fault outranks whatever the other side hit.
                Err(if s.is_fatal() && !d.is_fatal() { s } else { d })
            }
            (Ok(d), Err(e)) => self.degrade(IndexKind::Sparse, e).map(|marker| (d, Vec::new(), Some(marker))),
            (Err(e), Ok(s)) => self.degrade(IndexKind::Dense, e).map(|marker| (Vec::new(), s, Some(marker))),
        }
    }

    fn degrade(&self, failed: IndexKind, err: Error) -> Result<Degradation> {
        if err.is_fatal() || matches!(err, Error::Cancelled) || self.config.partial_failure == PartialFailurePolicy::FailFast {
            return Err(err);
        }
        warn!(%failed, error = %err, "serving single-source results");
        Ok(Degradation { failed, reason: err.to_string() })
    }

    /// Every hit of one sub-search must be live at `epoch` in the other
    /// index with the same version.
    fn check_presence(&self, results: &[QueryResult], other: &dyn IndexMaintenance, epoch: Version) -> Result<()> {
        for r in results {
            let state = other.entry_state(&r.chunk_id, epoch)?;
            let consistent = state.as_ref().is_some_and(|e| !e.tombstoned && e.version == r.version);
            if !consistent {
                error!(
                    chunk_id = %r.chunk_id,
                    found_in = %r.source_index,
                    missing_from = %other.kind(),
                    epoch,
                    ?state,
                    "hit is not consistently present in both indices"
                );
                return Err(Error::InconsistentState(format!(
                    "chunk {} returned by {} search is not live at version {} in the {} index",
                    r.chunk_id,
                    r.source_index,
                    r.version,
                    other.kind()
                )));
            }
        }
        Ok(())
    }
}

/// Run one blocking sub-search with a wall-clock limit. On timeout the
/// search is told to stop and its result is discarded.
fn sub_search<F>(
    kind: IndexKind,
    limit: Duration,
    cancel: CancelFlag,
    search: F,
) -> impl Future<Output = Result<Vec<SearchHit>>>
where
    F: FnOnce() -> Result<Vec<SearchHit>> + Send + 'static,
{
    async move {
        let started = Instant::now();
        match tokio::time::timeout(limit, tokio::task::spawn_blocking(search)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::SubSearchFailed { kind, reason: join.to_string() }),
            Err(_) => {
                cancel.cancel();
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(%kind, elapsed_ms, "sub-search timed out");
                Err(Error::SubSearchTimeout { kind, elapsed_ms })
            }
        }
    }
}

fn ranked(source: IndexKind, hits: Vec<SearchHit>) -> Vec<QueryResult> {
    hits.into_iter()
        .enumerate()
        .map(|(i, hit)| QueryResult {
            chunk_id: hit.chunk.id.clone(),
            rank: i + 1,
            raw_score: hit.score,
            source_index: source,
            version: hit.version,
            chunk: hit.chunk,
        })
        .collect()
}

/// Attach chunk content to the fused hits. A chunk found by both searches
/// is taken from the dense results.
fn hydrate_all(fused: Vec<FusedResult>, dense: &[QueryResult], sparse: &[QueryResult]) -> Vec<HybridHit> {
    let mut by_id: HashMap<&str, &QueryResult> = HashMap::with_capacity(dense.len() + sparse.len());
    for r in dense.iter().chain(sparse) {
        by_id.entry(r.chunk_id.as_str()).or_insert(r);
    }
    fused
        .into_iter()
        .filter_map(|f| {
            let hit = by_id.get(f.chunk_id.as_str())?;
            Some(hydrate(&hit.chunk, hit.version, f.combined_score, f.contributing_ranks))
        })
        .collect()
}

fn hydrate(chunk: &Chunk, version: Version, combined_score: f64, contributing_ranks: Vec<ContributingRank>) -> HybridHit {
    HybridHit {
        chunk_id: chunk.id.clone(),
        combined_score,
        text: chunk.text.clone(),
        citation_url: chunk.citation_url.clone(),
        metadata: chunk.metadata.clone(),
        contributing_ranks,
        version,
    }
}
