//! Coordinates writes, compaction and integrity across the dense and sparse
//! indices.
//!
//! Every write batch is applied to both indices under one unpublished
//! version and only becomes visible when the epoch clock publishes it. A
//! failure in either index aborts that version in both, so a reader never
//! sees a chunk in one index but not the other.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use ragdb_core::config::Settings;
use ragdb_core::error::{Error, Result};
use ragdb_core::filter::Filter;
use ragdb_core::traits::{IndexMaintenance, TextIndexer, VectorIndexer};
use ragdb_core::types::{Chunk, ChunkId, CompactionReport, Embedding, IndexEntry, IndexKind, IndexStats, Version};

use crate::clock::{EpochClock, ReadPin};
use crate::retry::RetryPolicy;

/// A chunk together with the representations computed for it at ingestion.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub chunk: Arc<Chunk>,
    pub embedding: Embedding,
}

impl PreparedChunk {
    pub fn new(chunk: impl Into<Arc<Chunk>>, embedding: Embedding) -> Self {
        Self { chunk: chunk.into(), embedding }
    }
}

/// Deletes and upserts that become visible together.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    deletes: Vec<ChunkId>,
    upserts: Vec<PreparedChunk>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(mut self, id: impl Into<ChunkId>) -> Self {
        self.deletes.push(id.into());
        self
    }

    pub fn upsert(mut self, prepared: PreparedChunk) -> Self {
        self.upserts.push(prepared);
        self
    }

    pub fn extend_deletes(mut self, ids: impl IntoIterator<Item = ChunkId>) -> Self {
        self.deletes.extend(ids);
        self
    }

    pub fn extend_upserts(mut self, prepared: impl IntoIterator<Item = PreparedChunk>) -> Self {
        self.upserts.extend(prepared);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.upserts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// Epoch at which the batch is visible.
    pub version: Version,
    pub upserted: usize,
    /// Deletes that found a live entry.
    pub deleted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub epoch: Version,
    pub dense: IndexStats,
    pub sparse: IndexStats,
    pub active_readers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub epoch: Version,
    pub checked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    /// Tombstone share of physical entries above which compaction is due.
    pub compaction_tombstone_ratio: f32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { retry: RetryPolicy::default(), compaction_tombstone_ratio: 0.3 }
    }
}

impl From<&Settings> for ManagerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            retry: RetryPolicy::from(&settings.retry),
            compaction_tombstone_ratio: settings.index.compaction_tombstone_ratio,
        }
    }
}

pub struct HybridIndex<D, S> {
    dense: Arc<D>,
    sparse: Arc<S>,
    clock: Arc<EpochClock>,
    writer: Mutex<()>,
    config: ManagerConfig,
}

impl<D, S> HybridIndex<D, S>
where
    D: VectorIndexer + 'static,
    S: TextIndexer + 'static,
{
    pub fn new(dense: D, sparse: S, config: ManagerConfig) -> Self {
        Self::from_parts(Arc::new(dense), Arc::new(sparse), EpochClock::new(), config)
    }

    pub fn from_parts(dense: Arc<D>, sparse: Arc<S>, clock: Arc<EpochClock>, config: ManagerConfig) -> Self {
        Self { dense, sparse, clock, writer: Mutex::new(()), config }
    }

    pub fn dense(&self) -> &Arc<D> {
        &self.dense
    }

    pub fn sparse(&self) -> &Arc<S> {
        &self.sparse
    }

    pub fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    pub fn epoch(&self) -> Version {
        self.clock.committed()
    }

    pub fn pin(&self) -> Result<ReadPin> {
        self.clock.pin()
    }

    fn maintenance(&self, kind: IndexKind) -> &dyn IndexMaintenance {
        match kind {
            IndexKind::Dense => self.dense.as_ref() as &dyn IndexMaintenance,
            IndexKind::Sparse => self.sparse.as_ref() as &dyn IndexMaintenance,
        }
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer.lock().map_err(|_| Error::InconsistentState("manager writer lock poisoned".into()))
    }

    /// Apply `batch` to both indices and publish it as one epoch.
    pub fn commit(&self, batch: WriteBatch) -> Result<CommitReport> {
        let _writer = self.lock_writer()?;
        self.commit_locked(batch)
    }

    #[instrument(skip_all, fields(deletes = batch.deletes.len(), upserts = batch.upserts.len()))]
    fn commit_locked(&self, batch: WriteBatch) -> Result<CommitReport> {
        self.validate(&batch)?;
        if batch.is_empty() {
            return Ok(CommitReport { version: self.clock.committed(), upserted: 0, deleted: 0 });
        }
        let version = self.clock.pending();
        match self.apply(&batch, version) {
            Ok(deleted) => {
                self.clock.publish(version);
                debug!(version, upserted = batch.upserts.len(), deleted, "committed write batch");
                Ok(CommitReport { version, upserted: batch.upserts.len(), deleted })
            }
            Err(e) => {
                warn!(version, error = %e, "write batch failed, rolling back");
                self.rollback(version)?;
                Err(e)
            }
        }
    }

    fn validate(&self, batch: &WriteBatch) -> Result<()> {
        let dim = self.dense.dim();
        for p in &batch.upserts {
            if p.chunk.id.is_empty() {
                return Err(Error::validation("chunk id must not be empty"));
            }
            if p.embedding.chunk_id != p.chunk.id {
                return Err(Error::validation(format!(
                    "embedding for {} attached to chunk {}",
                    p.embedding.chunk_id, p.chunk.id
                )));
            }
            if p.embedding.dense.len() != dim {
                return Err(Error::validation(format!(
                    "chunk {} has a {}-dimensional vector, dense index expects {dim}",
                    p.chunk.id,
                    p.embedding.dense.len()
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, batch: &WriteBatch, version: Version) -> Result<usize> {
        let retry = self.config.retry;
        let mut deleted = 0;
        for id in &batch.deletes {
            let in_dense = retry.run(IndexKind::Dense, "delete", || self.dense.delete(id, version))?;
            let in_sparse = retry.run(IndexKind::Sparse, "delete", || self.sparse.delete(id, version))?;
            if in_dense != in_sparse {
                let msg = format!("chunk {id} live in {} index only", if in_dense { "dense" } else { "sparse" });
                error!(chunk_id = %id, in_dense, in_sparse, "delete found a partially present chunk");
                return Err(Error::InconsistentState(msg));
            }
            deleted += usize::from(in_dense);
        }
        for p in &batch.upserts {
            retry.run(IndexKind::Dense, "upsert", || {
                self.dense.upsert(Arc::clone(&p.chunk), &p.embedding.dense, version)
            })?;
            retry.run(IndexKind::Sparse, "upsert", || {
                self.sparse.upsert(Arc::clone(&p.chunk), &p.embedding.sparse, version)
            })?;
        }
        Ok(deleted)
    }

    fn rollback(&self, version: Version) -> Result<()> {
        let retry = self.config.retry;
        let mut failed = Vec::new();
        for kind in IndexKind::ALL {
            if let Err(e) = retry.run(kind, "abort", || self.maintenance(kind).abort(version)) {
                error!(%kind, version, error = %e, "rollback failed");
                failed.push(format!("{kind}: {e}"));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::InconsistentState(format!("rollback of version {version} failed ({})", failed.join("; "))))
        }
    }

    pub fn upsert(&self, prepared: PreparedChunk) -> Result<CommitReport> {
        self.commit(WriteBatch::new().upsert(prepared))
    }

    pub fn upsert_many(&self, prepared: Vec<PreparedChunk>) -> Result<CommitReport> {
        self.commit(WriteBatch::new().extend_upserts(prepared))
    }

    /// Tombstone `id` in both indices. Returns whether it was live.
    pub fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.commit(WriteBatch::new().delete(id))?.deleted > 0)
    }

    /// Tombstone every live chunk matching `filter` as one epoch.
    pub fn delete_by_filter(&self, filter: &Filter) -> Result<usize> {
        if filter.is_empty() {
            return Err(Error::validation("delete by filter needs at least one predicate"));
        }
        let _writer = self.lock_writer()?;
        let ids = self.matching_locked(filter)?;
        let report = self.commit_locked(WriteBatch::new().extend_deletes(ids))?;
        info!(%filter, deleted = report.deleted, version = report.version, "deleted by filter");
        Ok(report.deleted)
    }

    pub fn delete_document(&self, doc_id: &str) -> Result<usize> {
        self.delete_by_filter(&document_filter(doc_id))
    }

    /// Swap all chunks of `doc_id` for `chunks` in a single epoch.
    pub fn replace_document(&self, doc_id: &str, chunks: Vec<PreparedChunk>) -> Result<CommitReport> {
        if let Some(stray) = chunks.iter().find(|p| p.chunk.source_doc_id != doc_id) {
            return Err(Error::validation(format!("chunk {} does not belong to document {doc_id}", stray.chunk.id)));
        }
        let _writer = self.lock_writer()?;
        let old = self.matching_locked(&document_filter(doc_id))?;
        self.commit_locked(WriteBatch::new().extend_deletes(old).extend_upserts(chunks))
    }

    /// Live chunk ids of `doc_id` at the committed epoch.
    pub fn document_chunk_ids(&self, doc_id: &str) -> Result<Vec<ChunkId>> {
        let _writer = self.lock_writer()?;
        self.matching_locked(&document_filter(doc_id))
    }

    fn matching_locked(&self, filter: &Filter) -> Result<Vec<ChunkId>> {
        let at = self.clock.committed();
        let retry = self.config.retry;
        let dense: BTreeSet<ChunkId> =
            retry.run(IndexKind::Dense, "match", || self.dense.matching_ids(filter, at))?.into_iter().collect();
        let sparse: BTreeSet<ChunkId> =
            retry.run(IndexKind::Sparse, "match", || self.sparse.matching_ids(filter, at))?.into_iter().collect();
        if dense != sparse {
            let only: Vec<&ChunkId> = dense.symmetric_difference(&sparse).take(5).collect();
            error!(%filter, at, ?only, "indices disagree on matching chunks");
            return Err(Error::InconsistentState(format!("indices disagree on chunks matching `{filter}`: {only:?}")));
        }
        Ok(dense.into_iter().collect())
    }

    /// Live entries of one index kind at the committed epoch.
    pub fn count(&self, kind: IndexKind) -> Result<usize> {
        self.maintenance(kind).count(self.clock.committed())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let pin = self.pin()?;
        Ok(EngineStats {
            epoch: pin.epoch(),
            dense: self.dense.stats(pin.epoch())?,
            sparse: self.sparse.stats(pin.epoch())?,
            active_readers: self.clock.active_readers(),
        })
    }

    /// Reclaim entries no pinned reader can see.
    pub fn compact(&self, kind: IndexKind) -> Result<CompactionReport> {
        let horizon = self.clock.horizon()?;
        self.config.retry.run(kind, "compact", || self.maintenance(kind).compact(horizon))
    }

    pub fn compact_all(&self) -> Result<Vec<CompactionReport>> {
        IndexKind::ALL.into_iter().map(|kind| self.compact(kind)).collect()
    }

    pub fn needs_compaction(&self, kind: IndexKind) -> Result<bool> {
        let stats = self.maintenance(kind).stats(self.clock.committed())?;
        Ok(stats.tombstoned > 0 && stats.tombstone_ratio() > self.config.compaction_tombstone_ratio)
    }

    pub fn compact_if_needed(&self) -> Result<Vec<CompactionReport>> {
        let mut reports = Vec::new();
        for kind in IndexKind::ALL {
            if self.needs_compaction(kind)? {
                reports.push(self.compact(kind)?);
            }
        }
        Ok(reports)
    }

    /// Run `compact(kind)` on the blocking pool.
    pub fn spawn_compaction(self: &Arc<Self>, kind: IndexKind) -> JoinHandle<Result<CompactionReport>> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.compact(kind))
    }

    /// Compare both indices entry by entry at the committed epoch.
    #[instrument(skip(self))]
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let pin = self.pin()?;
        let at = pin.epoch();
        let dense = self.dense.live_entries(at)?;
        let sparse = self.sparse.live_entries(at)?;

        let mut problems = Vec::new();
        let (mut i, mut j) = (0, 0);
        loop {
            match (dense.get(i), sparse.get(j)) {
                (None, None) => break,
                (Some(a), Some(b)) if a.chunk_id == b.chunk_id => {
                    if a.version != b.version {
                        problems.push(format!("{}: dense v{} vs sparse v{}", a.chunk_id, a.version, b.version));
                    }
                    i += 1;
                    j += 1;
                }
                (Some(a), Some(b)) if a.chunk_id < b.chunk_id => {
                    problems.push(only_in(a));
                    i += 1;
                }
                (Some(a), None) => {
                    problems.push(only_in(a));
                    i += 1;
                }
                (_, Some(b)) => {
                    problems.push(only_in(b));
                    j += 1;
                }
            }
        }

        if problems.is_empty() {
            debug!(at, checked = dense.len(), "integrity verified");
            return Ok(IntegrityReport { epoch: at, checked: dense.len() });
        }
        error!(at, mismatches = problems.len(), first = %problems[0], "index integrity violated");
        Err(Error::InconsistentState(format!(
            "{} mismatched entries at epoch {at}: {}",
            problems.len(),
            problems.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
        )))
    }
}

fn only_in(entry: &IndexEntry) -> String {
    format!("{} only in {} index", entry.chunk_id, entry.index_kind)
}

pub fn document_filter(doc_id: &str) -> Filter {
    Filter::new().eq("doc_id", doc_id)
}
