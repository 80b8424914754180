use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, BoostQuery, Occur, Query, TermQuery, TermSetQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, FAST, INDEXED, STORED};
use tantivy::tokenizer::{PreTokenizedString, Token};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info, instrument, warn};

use ragdb_core::error::{Error, Result};
use ragdb_core::filter::Filter;
use ragdb_core::store::{EntryTable, Slot};
use ragdb_core::traits::{IndexMaintenance, SearchScope, TextIndexer};
use ragdb_core::types::{
    top_k, Chunk, ChunkId, CompactionReport, CompactionStatus, IndexEntry, IndexKind, IndexStats, SearchHit,
    SparseTerms, Version,
};

const CANCEL_POLL: usize = 1024;
const WRITER_HEAP_BYTES: usize = 50_000_000;
/// Upper bound on the indexed frequency of a single term.
const MAX_TERM_FREQ: f32 = 65_535.0;

#[derive(Debug, Clone, Copy)]
struct Fields {
    key: Field,
    terms: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut schema_builder = Schema::builder();
    let key = schema_builder.add_u64_field("key", INDEXED | STORED | FAST);
    let terms_indexing = TextFieldIndexing::default().set_tokenizer("raw").set_index_option(IndexRecordOption::WithFreqs);
    let terms = schema_builder.add_text_field("terms", TextOptions::default().set_indexing_options(terms_indexing));
    (schema_builder.build(), Fields { key, terms })
}

fn backend(err: impl Display) -> Error {
    Error::unavailable(IndexKind::Sparse, err.to_string())
}

/// Tantivy document key of an entry.
#[derive(Debug, Clone, Copy)]
struct Doc {
    key: u64,
}

#[derive(Debug, Default)]
struct State {
    table: EntryTable<Doc>,
    last_compaction: Option<DateTime<Utc>>,
}

/// BM25 inverted index on an in-memory tantivy index.
///
/// Every entry of the version table is one tantivy document. Term weights
/// from the encoder are indexed as term frequencies, so a document's length
/// is the sum of its weights. Tantivy keeps superseded documents until
/// compaction deletes them; searches restrict scoring to the keys visible
/// to the reader's epoch and admitted by its filter.
pub struct SparseIndex {
    reader: IndexReader,
    fields: Fields,
    writer: Mutex<IndexWriter>,
    state: RwLock<State>,
    next_key: AtomicU64,
    compacting: AtomicBool,
}

struct CompactionGuard<'a>(&'a AtomicBool);

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SparseIndex {
    pub fn in_memory() -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into().map_err(backend)?;
        let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES).map_err(backend)?;
        Ok(Self {
            reader,
            fields,
            writer: Mutex::new(writer),
            state: RwLock::new(State::default()),
            next_key: AtomicU64::new(0),
            compacting: AtomicBool::new(false),
        })
    }

    /// Documents tantivy still holds, superseded ones included.
    pub fn stored_documents(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| Error::poisoned(IndexKind::Sparse))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| Error::poisoned(IndexKind::Sparse))
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, IndexWriter>> {
        self.writer.lock().map_err(|_| Error::poisoned(IndexKind::Sparse))
    }

    fn document(&self, key: u64, terms: &SparseTerms) -> TantivyDocument {
        let mut tokens = Vec::new();
        for (term, &weight) in terms {
            if weight == 0.0 {
                continue;
            }
            let freq = weight.round().clamp(1.0, MAX_TERM_FREQ) as usize;
            for _ in 0..freq {
                tokens.push(Token { position: tokens.len(), text: term.clone(), ..Token::default() });
            }
        }
        let mut doc = TantivyDocument::new();
        doc.add_u64(self.fields.key, key);
        doc.add_pre_tokenized_text(self.fields.terms, PreTokenizedString { text: String::new(), tokens });
        doc
    }

    /// Weighted disjunction of the query terms, restricted to `keys`.
    fn query(&self, terms: &[(&String, f32)], keys: impl Iterator<Item = u64>) -> BooleanQuery {
        let scored: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|(term, weight)| {
                let q = TermQuery::new(Term::from_field_text(self.fields.terms, term), IndexRecordOption::WithFreqs);
                (Occur::Should, Box::new(BoostQuery::new(Box::new(q), *weight)) as Box<dyn Query>)
            })
            .collect();
        let visible = TermSetQuery::new(keys.map(|k| Term::from_field_u64(self.fields.key, k)));
        BooleanQuery::new(vec![
            (Occur::Must, Box::new(BooleanQuery::new(scored)) as Box<dyn Query>),
            (Occur::Must, Box::new(BoostQuery::new(Box::new(visible), 0.0))),
        ])
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        if let Err(err) = writer.commit() {
            if let Err(rollback) = writer.rollback() {
                warn!(error = %rollback, "sparse writer rollback failed");
            }
            return Err(backend(err));
        }
        self.reader.reload().map_err(backend)
    }
}

impl IndexMaintenance for SparseIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Sparse
    }

    fn delete(&self, id: &str, version: Version) -> Result<bool> {
        let _writer = self.lock_writer()?;
        Ok(self.write()?.table.delete(id, version).is_some())
    }

    fn abort(&self, version: Version) -> Result<()> {
        let _writer = self.lock_writer()?;
        let outcome = self.write()?.table.abort(version);
        debug!(version, killed = outcome.killed.len(), revived = outcome.revived.len(), "aborted sparse writes");
        Ok(())
    }

    #[instrument(skip(self), fields(kind = "sparse"))]
    fn compact(&self, horizon: Version) -> Result<CompactionReport> {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return Ok(CompactionReport::already_running(IndexKind::Sparse, horizon));
        }
        let _running = CompactionGuard(&self.compacting);
        let mut writer = self.lock_writer()?;

        let (table, purged) = {
            let state = self.read()?;
            let (table, remap) = state.table.compacted(horizon);
            let purged: Vec<u64> = state
                .table
                .slots()
                .zip(&remap)
                .filter(|(_, kept)| kept.is_none())
                .map(|((_, slot), _)| slot.payload.key)
                .collect();
            (table, purged)
        };
        if !purged.is_empty() {
            for &key in &purged {
                writer.delete_term(Term::from_field_u64(self.fields.key, key));
            }
            self.commit(&mut writer)?;
        }

        let mut state = self.write()?;
        state.table = table;
        state.last_compaction = Some(Utc::now());
        let retained = state.table.physical();
        let reclaimed = purged.len();
        info!(horizon, reclaimed, retained, "sparse compaction finished");
        Ok(CompactionReport { kind: IndexKind::Sparse, status: CompactionStatus::Completed, reclaimed, retained, horizon })
    }

    fn stats(&self, at: Version) -> Result<IndexStats> {
        let state = self.read()?;
        Ok(IndexStats {
            kind: IndexKind::Sparse,
            live: state.table.live_at(at),
            tombstoned: state.table.tombstoned(),
            physical: state.table.physical(),
            graph_size: 0,
            last_compaction: state.last_compaction,
        })
    }

    fn entry_state(&self, id: &str, at: Version) -> Result<Option<IndexEntry>> {
        Ok(self.read()?.table.entry_state(IndexKind::Sparse, id, at))
    }

    fn matching_ids(&self, filter: &Filter, at: Version) -> Result<Vec<ChunkId>> {
        Ok(self.read()?.table.matching_ids(filter, at))
    }

    fn live_entries(&self, at: Version) -> Result<Vec<IndexEntry>> {
        Ok(self.read()?.table.live_entries(IndexKind::Sparse, at))
    }
}

impl TextIndexer for SparseIndex {
    fn upsert(&self, chunk: Arc<Chunk>, terms: &SparseTerms, version: Version) -> Result<()> {
        if let Some((term, w)) = terms.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(Error::validation(format!("term '{term}' of chunk {} has invalid weight {w}", chunk.id)));
        }
        let mut writer = self.lock_writer()?;
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        writer.add_document(self.document(key, terms)).map_err(backend)?;
        self.commit(&mut writer)?;
        self.write()?.table.insert(chunk, Doc { key }, version);
        Ok(())
    }

    #[instrument(skip_all, fields(terms = terms.len(), k = k, at = scope.at))]
    fn search(&self, terms: &SparseTerms, k: usize, scope: &SearchScope<'_>) -> Result<Vec<SearchHit>> {
        let weighted: Vec<(&String, f32)> =
            terms.iter().filter(|(_, w)| w.is_finite() && **w > 0.0).map(|(t, &w)| (t, w)).collect();
        if k == 0 || weighted.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let mut admitted: HashMap<u64, &Slot<Doc>> = HashMap::new();
        for (i, (_, slot)) in state.table.visible(scope.at).enumerate() {
            if i % CANCEL_POLL == 0 {
                scope.cancel.check()?;
            }
            if scope.admits(&slot.chunk) {
                admitted.insert(slot.payload.key, slot);
            }
        }
        if admitted.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.query(&weighted, admitted.keys().copied());
        let searcher = self.reader.searcher();
        let top = searcher.search(&query, &TopDocs::with_limit(admitted.len())).map_err(backend)?;
        scope.cancel.check()?;

        // Ties across the cut-off break by chunk id, so keep every doc
        // scoring at least the k-th score.
        let cutoff = top.get(k - 1).map(|(score, _)| *score);
        let mut hits = Vec::new();
        for (score, addr) in top.into_iter().take_while(|(score, _)| cutoff.map_or(true, |c| *score >= c)) {
            let doc: TantivyDocument = searcher.doc(addr).map_err(backend)?;
            let Some(slot) = doc.get_first(self.fields.key).and_then(|v| v.as_u64()).and_then(|key| admitted.get(&key))
            else {
                continue;
            };
            hits.push(SearchHit { chunk: slot.chunk.clone(), score, version: slot.life.created });
        }
        let hits = top_k(hits, k);
        debug!(hits = hits.len(), admitted = admitted.len(), "sparse search");
        Ok(hits)
    }
}
