use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use serde::Serialize;
use tracing::{debug, info, instrument};

use ragdb_core::chunker::Chunker;
use ragdb_core::error::{Error, Result};
use ragdb_core::traits::{Encoder, TextIndexer, VectorIndexer};
use ragdb_core::types::{content_hash, IngestRecord, Version};

use crate::manager::{HybridIndex, PreparedChunk};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunks: usize,
    /// Chunks of the previous revision that were tombstoned.
    pub replaced: usize,
    /// The document was unchanged and nothing was written.
    pub skipped: bool,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    hash: String,
    chunks: usize,
}

/// Record -> chunks -> embeddings -> one atomic document replacement.
pub struct IngestPipeline<D, S> {
    chunker: Chunker,
    encoder: Arc<dyn Encoder>,
    index: Arc<HybridIndex<D, S>>,
    seen: Mutex<HashMap<String, Fingerprint>>,
}

impl<D, S> IngestPipeline<D, S>
where
    D: VectorIndexer + 'static,
    S: TextIndexer + 'static,
{
    pub fn new(chunker: Chunker, encoder: Arc<dyn Encoder>, index: Arc<HybridIndex<D, S>>) -> Result<Self> {
        let max_chunk = chunker.config().max_chunk_tokens;
        if max_chunk > encoder.max_tokens() {
            return Err(Error::InvalidConfig(format!(
                "max_chunk_tokens {max_chunk} exceeds the {} encoder budget of {} tokens",
                encoder.name(),
                encoder.max_tokens()
            )));
        }
        if encoder.dim() != index.dense().dim() {
            return Err(Error::InvalidConfig(format!(
                "{} encoder produces {}-dimensional vectors, dense index expects {}",
                encoder.name(),
                encoder.dim(),
                index.dense().dim()
            )));
        }
        Ok(Self { chunker, encoder, index, seen: Mutex::new(HashMap::new()) })
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    #[instrument(skip_all, fields(doc_id = %record.doc_id))]
    pub fn ingest(&self, record: &IngestRecord) -> Result<IngestReport> {
        if record.doc_id.trim().is_empty() {
            return Err(Error::validation("doc_id must not be empty"));
        }
        let hash = fingerprint(record);
        let previous = self.seen()?.get(&record.doc_id).cloned();
        if let Some(prev) = previous.filter(|p| p.hash == hash) {
            // Deletes issued around the pipeline invalidate the fingerprint.
            let live = self.index.document_chunk_ids(&record.doc_id)?.len();
            if live == prev.chunks {
                debug!(chunks = live, "document unchanged");
                return Ok(IngestReport {
                    doc_id: record.doc_id.clone(),
                    chunks: live,
                    replaced: 0,
                    skipped: true,
                    version: self.index.epoch(),
                });
            }
        }

        let chunks = self.chunker.chunk_record(record);
        let prepared = chunks
            .into_iter()
            .map(|chunk| {
                let embedding = self.encoder.embed(&chunk)?;
                Ok(PreparedChunk::new(chunk, embedding))
            })
            .collect::<Result<Vec<_>>>()?;
        let count = prepared.len();
        let report = self.index.replace_document(&record.doc_id, prepared)?;

        self.seen()?.insert(record.doc_id.clone(), Fingerprint { hash, chunks: count });
        info!(chunks = count, replaced = report.deleted, version = report.version, "ingested document");
        Ok(IngestReport {
            doc_id: record.doc_id.clone(),
            chunks: count,
            replaced: report.deleted,
            skipped: false,
            version: report.version,
        })
    }

    /// Ingest records one by one; stops at the first failure.
    pub fn ingest_many<'a, I>(&self, records: I) -> Result<Vec<IngestReport>>
    where
        I: IntoIterator<Item = &'a IngestRecord>,
    {
        records.into_iter().map(|r| self.ingest(r)).collect()
    }

    pub fn remove_document(&self, doc_id: &str) -> Result<usize> {
        let removed = self.index.delete_document(doc_id)?;
        self.seen()?.remove(doc_id);
        Ok(removed)
    }

    fn seen(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Fingerprint>>> {
        self.seen.lock().map_err(|_| Error::InconsistentState("ingest fingerprint cache poisoned".into()))
    }
}

/// Hash over everything that ends up in the chunks.
fn fingerprint(record: &IngestRecord) -> String {
    let metadata: BTreeMap<_, _> = record.metadata.iter().collect();
    let mut buf = String::with_capacity(record.text.len() + 64);
    buf.push_str(&record.text);
    buf.push('\u{0}');
    buf.push_str(&record.resolved_citation_url());
    for (k, v) in metadata {
        buf.push('\u{0}');
        buf.push_str(k);
        buf.push('=');
        buf.push_str(v);
    }
    for hint in &record.structural_hints {
        buf.push_str(&format!("\u{0}{hint}"));
    }
    content_hash(&buf)
}
