use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use ragdb_core::config::IndexConfig;
use ragdb_core::error::{Error, Result};
use ragdb_core::filter::Filter;
use ragdb_core::store::EntryTable;
use ragdb_core::traits::{IndexMaintenance, SearchScope, VectorIndexer};
use ragdb_core::types::{
    top_k, Chunk, ChunkId, CompactionReport, CompactionStatus, IndexEntry, IndexKind, IndexStats, SearchHit, Version,
};

use crate::graph::{dot, normalize, AnnGraph};

const CANCEL_POLL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseConfig {
    pub dim: usize,
    /// Live entries needed before compaction builds the graph.
    pub min_graph_size: usize,
    pub ef_search: usize,
    pub max_connections: usize,
}

impl DenseConfig {
    pub fn new(dim: usize) -> Self {
        Self { dim, min_graph_size: 1024, ef_search: 64, max_connections: 16 }
    }

    pub fn from_index_config(dim: usize, cfg: &IndexConfig) -> Self {
        Self {
            dim,
            min_graph_size: cfg.min_graph_size,
            ef_search: cfg.ef_search,
            max_connections: cfg.max_connections,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    table: EntryTable<Arc<[f32]>>,
    graph: Option<AnnGraph>,
    last_compaction: Option<DateTime<Utc>>,
}

/// Cosine-similarity index over L2-normalised vectors.
///
/// Until the first compaction with at least `min_graph_size` live vectors
/// the search is exhaustive. After that it walks the HNSW graph with an
/// `ef_search` beam and always scans vectors written since the build. A
/// walk that comes back short of `k` admitted hits falls back to a full scan.
pub struct DenseIndex {
    config: DenseConfig,
    state: RwLock<State>,
    writer: Mutex<()>,
    compacting: AtomicBool,
}

struct CompactionGuard<'a>(&'a AtomicBool);

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DenseIndex {
    pub fn new(config: DenseConfig) -> Self {
        Self { config, state: RwLock::new(State::default()), writer: Mutex::new(()), compacting: AtomicBool::new(false) }
    }

    pub fn config(&self) -> &DenseConfig {
        &self.config
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| Error::poisoned(IndexKind::Dense))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| Error::poisoned(IndexKind::Dense))
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer.lock().map_err(|_| Error::poisoned(IndexKind::Dense))
    }

    fn unit_vector(&self, v: &[f32], what: &str) -> Result<Vec<f32>> {
        if v.len() != self.config.dim {
            return Err(Error::validation(format!(
                "{what} has dimension {}, index expects {}",
                v.len(),
                self.config.dim
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::validation(format!("{what} contains non-finite values")));
        }
        let mut unit = v.to_vec();
        if !normalize(&mut unit) {
            return Err(Error::validation(format!("{what} is a zero vector")));
        }
        Ok(unit)
    }
}

impl IndexMaintenance for DenseIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Dense
    }

    fn delete(&self, id: &str, version: Version) -> Result<bool> {
        let _writer = self.lock_writer()?;
        Ok(self.write()?.table.delete(id, version).is_some())
    }

    fn abort(&self, version: Version) -> Result<()> {
        let _writer = self.lock_writer()?;
        let outcome = self.write()?.table.abort(version);
        debug!(version, killed = outcome.killed.len(), revived = outcome.revived.len(), "aborted dense writes");
        Ok(())
    }

    #[instrument(skip(self), fields(kind = "dense"))]
    fn compact(&self, horizon: Version) -> Result<CompactionReport> {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return Ok(CompactionReport::already_running(IndexKind::Dense, horizon));
        }
        let _running = CompactionGuard(&self.compacting);
        let _writer = self.lock_writer()?;

        let (next, reclaimed) = {
            let state = self.read()?;
            let (table, _) = state.table.compacted(horizon);
            let reclaimed = state.table.physical() - table.physical();
            let live = table.current();
            // Tombstoned entries that pinned readers can still see stay in the graph.
            let graph = if live > 0 && live >= self.config.min_graph_size {
                AnnGraph::build(
                    table.slots().map(|(i, s)| (i, &s.payload[..])),
                    table.physical(),
                    self.config.max_connections,
                )
            } else {
                None
            };
            (State { table, graph, last_compaction: None }, reclaimed)
        };

        let mut state = self.write()?;
        *state = next;
        state.last_compaction = Some(Utc::now());
        let retained = state.table.physical();
        let graph_size = state.graph.as_ref().map_or(0, AnnGraph::len);
        info!(horizon, reclaimed, retained, graph_size, "dense compaction finished");
        Ok(CompactionReport { kind: IndexKind::Dense, status: CompactionStatus::Completed, reclaimed, retained, horizon })
    }

    fn stats(&self, at: Version) -> Result<IndexStats> {
        let state = self.read()?;
        Ok(IndexStats {
            kind: IndexKind::Dense,
            live: state.table.live_at(at),
            tombstoned: state.table.tombstoned(),
            physical: state.table.physical(),
            graph_size: state.graph.as_ref().map_or(0, AnnGraph::len),
            last_compaction: state.last_compaction,
        })
    }

    fn entry_state(&self, id: &str, at: Version) -> Result<Option<IndexEntry>> {
        Ok(self.read()?.table.entry_state(IndexKind::Dense, id, at))
    }

    fn matching_ids(&self, filter: &Filter, at: Version) -> Result<Vec<ChunkId>> {
        Ok(self.read()?.table.matching_ids(filter, at))
    }

    fn live_entries(&self, at: Version) -> Result<Vec<IndexEntry>> {
        Ok(self.read()?.table.live_entries(IndexKind::Dense, at))
    }
}

impl VectorIndexer for DenseIndex {
    fn dim(&self) -> usize {
        self.config.dim
    }

    fn upsert(&self, chunk: Arc<Chunk>, vector: &[f32], version: Version) -> Result<()> {
        let unit = self.unit_vector(vector, &format!("vector of chunk {}", chunk.id))?;
        let _writer = self.lock_writer()?;
        self.write()?.table.insert(chunk, Arc::from(unit), version);
        Ok(())
    }

    #[instrument(skip_all, fields(k = k, at = scope.at))]
    fn search_vec(&self, query: &[f32], k: usize, scope: &SearchScope<'_>) -> Result<Vec<SearchHit>> {
        let query = self.unit_vector(query, "query vector")?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let total = state.table.physical();
        let (hits, scanned) = match &state.graph {
            Some(graph) => {
                scope.cancel.check()?;
                let admit = |slot: usize| {
                    state.table.slot(slot).is_some_and(|s| s.life.visible_at(scope.at) && scope.admits(&s.chunk))
                };
                let mut candidates = graph.nearest(&query, k, self.config.ef_search, &admit);
                candidates.extend(graph.tail(total));
                let (hits, scanned) = scan(&state, &query, candidates, scope)?;
                if hits.len() < k {
                    scan(&state, &query, 0..total, scope)?
                } else {
                    (hits, scanned)
                }
            }
            None => scan(&state, &query, 0..total, scope)?,
        };
        scope.cancel.check()?;
        let hits = top_k(hits, k);
        debug!(hits = hits.len(), scanned, "dense search");
        Ok(hits)
    }
}

/// Score the visible, admitted entries among `slots`.
fn scan(
    state: &State,
    query: &[f32],
    slots: impl IntoIterator<Item = usize>,
    scope: &SearchScope<'_>,
) -> Result<(Vec<SearchHit>, usize)> {
    let mut hits = Vec::new();
    let mut scanned = 0usize;
    for slot in slots {
        scanned += 1;
        if scanned % CANCEL_POLL == 0 {
            scope.cancel.check()?;
        }
        let Some(s) = state.table.slot(slot) else { continue };
        if !s.life.visible_at(scope.at) || !scope.admits(&s.chunk) {
            continue;
        }
        hits.push(SearchHit { chunk: s.chunk.clone(), score: dot(query, &s.payload), version: s.life.created });
    }
    Ok((hits, scanned))
}
