use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

use ragdb_core::cancel::CancelFlag;
use ragdb_core::filter::Filter;
use ragdb_core::traits::{IndexMaintenance, SearchScope, VectorIndexer};
use ragdb_core::types::{Chunk, CompactionStatus, Meta};
use ragdb_vector::{DenseConfig, DenseIndex};

fn chunk(id: &str, group: &str) -> Arc<Chunk> {
    let mut metadata = Meta::new();
    metadata.insert("group".into(), group.into());
    Arc::new(Chunk {
        id: id.into(),
        source_doc_id: id.into(),
        text: id.into(),
        token_count: 1,
        byte_start: 0,
        byte_end: id.len(),
        overlap_bytes: 0,
        chunk_index: 0,
        total_chunks: 1,
        citation_url: String::new(),
        metadata,
        content_hash: String::new(),
    })
}

/// Deterministic unit-ish vector spread over the circle in the first two dims.
fn vector(i: usize, dim: usize) -> Vec<f32> {
    let angle = i as f32 * 0.37;
    let mut v = vec![0.0; dim];
    v[0] = angle.cos();
    v[1] = angle.sin();
    v[2 % dim] += 0.1;
    v
}

fn ids(index: &DenseIndex, query: &[f32], k: usize, at: u64, filter: Option<&Filter>) -> Vec<String> {
    let cancel = CancelFlag::new();
    let scope = SearchScope { at, filter, cancel: &cancel };
    index.search_vec(query, k, &scope).unwrap().into_iter().map(|h| h.chunk.id.clone()).collect()
}

fn filled(config: DenseConfig, n: usize) -> DenseIndex {
    let index = DenseIndex::new(config);
    for i in 0..n {
        index.upsert(chunk(&format!("c{i:04}"), "g"), &vector(i, config.dim), 1).unwrap();
    }
    index
}

#[test]
fn delete_and_reupsert_are_versioned() {
    let index = DenseIndex::new(DenseConfig::new(3));
    index.upsert(chunk("a", "x"), &[1.0, 0.0, 0.0], 1).unwrap();
    index.upsert(chunk("b", "x"), &[0.0, 1.0, 0.0], 1).unwrap();

    index.upsert(chunk("a", "y"), &[0.0, 0.0, 1.0], 2).unwrap();
    index.delete("b", 2).unwrap();

    assert_eq!(ids(&index, &[1.0, 0.0, 0.0], 1, 1, None), vec!["a"]);
    assert_eq!(ids(&index, &[0.0, 1.0, 0.0], 5, 2, None), vec!["a"]);
    assert_eq!(index.count(1).unwrap(), 2);
    assert_eq!(index.count(2).unwrap(), 1);

    let y = Filter::new().eq("group", "y");
    assert_eq!(ids(&index, &[1.0, 0.0, 0.0], 5, 1, Some(&y)), Vec::<String>::new());
    assert_eq!(ids(&index, &[1.0, 0.0, 0.0], 5, 2, Some(&y)), vec!["a"]);
    assert_eq!(index.entry_state("a", 2).unwrap().unwrap().version, 2);
}

fn config(dim: usize, min_graph_size: usize, ef_search: usize) -> DenseConfig {
    DenseConfig { min_graph_size, ef_search, ..DenseConfig::new(dim) }
}

#[test]
fn graph_search_with_a_wide_beam_matches_exhaustive() {
    let dim = 4;
    let index = filled(config(dim, 64, 256), 256);
    let exhaustive = filled(config(dim, usize::MAX, 1), 256);
    let report = index.compact(1).unwrap();
    assert_eq!(report.status, CompactionStatus::Completed);
    assert_eq!(index.stats(1).unwrap().graph_size, 256);

    for i in [0, 77, 140, 255] {
        let q = vector(i, dim);
        assert_eq!(ids(&index, &q, 10, 1, None), ids(&exhaustive, &q, 10, 1, None));
    }

    // Writes after the build land in the scanned tail.
    index.upsert(chunk("late", "g"), &[0.0, 0.0, 0.0, 1.0], 2).unwrap();
    assert_eq!(ids(&index, &[0.0, 0.0, 0.0, 1.0], 1, 2, None), vec!["late"]);
}

#[test]
fn selective_filter_on_the_graph_still_finds_matches() {
    let dim = 4;
    let index = filled(config(dim, 64, 8), 200);
    index.upsert(chunk("rare", "h"), &vector(100, dim), 1).unwrap();
    index.compact(1).unwrap();
    assert_eq!(index.stats(1).unwrap().graph_size, 201);

    let h = Filter::new().eq("group", "h");
    assert_eq!(ids(&index, &vector(3, dim), 5, 1, Some(&h)), vec!["rare"]);
    let g = Filter::new().eq("group", "g");
    assert_eq!(ids(&index, &vector(3, dim), 5, 1, Some(&g)).len(), 5);
}

#[test]
fn small_sets_stay_exhaustive() {
    let index = filled(config(4, 1024, 1), 50);
    index.compact(1).unwrap();
    assert_eq!(index.stats(1).unwrap().graph_size, 0);
    let hits = ids(&index, &vector(3, 4), 5, 1, None);
    assert_eq!(hits.len(), 5);
    assert_eq!(hits[0], "c0003");
}

#[test]
fn queries_run_concurrently_with_compaction() {
    let index = Arc::new(filled(config(4, 32, 16), 200));
    for i in (0..200).step_by(3) {
        index.delete(&format!("c{i:04}"), 2).unwrap();
    }

    let compactor = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for _ in 0..5 {
                index.compact(2).unwrap();
            }
        })
    };
    let reader = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for i in 0..200 {
                let hits = ids(&index, &vector(i, 4), 20, 2, None);
                for id in hits {
                    let n: usize = id[1..].parse().unwrap();
                    assert_ne!(n % 3, 0, "tombstoned {id} returned");
                }
            }
        })
    };
    compactor.join().unwrap();
    reader.join().unwrap();
    assert_eq!(index.count(2).unwrap(), 200 - 67);
    assert_eq!(index.stats(2).unwrap().tombstoned, 0);
}

proptest! {
    #[test]
    fn scores_are_cosine_bounded(raw in prop::collection::vec(-10.0f32..10.0, 3), q in prop::collection::vec(-10.0f32..10.0, 3)) {
        prop_assume!(raw.iter().any(|x| x.abs() > 1e-3) && q.iter().any(|x| x.abs() > 1e-3));
        let index = DenseIndex::new(DenseConfig::new(3));
        index.upsert(chunk("a", "g"), &raw, 1).unwrap();
        let cancel = CancelFlag::new();
        let scope = SearchScope { at: 1, filter: None, cancel: &cancel };
        let hits = index.search_vec(&q, 1, &scope).unwrap();
        prop_assert_eq!(hits.len(), 1);
        prop_assert!(hits[0].score <= 1.0 + 1e-5 && hits[0].score >= -1.0 - 1e-5);
    }
}
