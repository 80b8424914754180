//! Reciprocal Rank Fusion over any number of ranked lists.
//!
//! Scores from different retrievers are not comparable, so only ranks are
//! used: `score(d) = Σ 1 / (k + rank(d))` over the lists that contain `d`.

use std::collections::HashMap;
use tracing::debug;

use ragdb_core::types::{ChunkId, ContributingRank, FusedResult, IndexKind, QueryResult};

pub const DEFAULT_RRF_K: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrfConfig {
    pub k: u32,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

/// One retriever's ranking. Ranks start at 1; a chunk listed twice keeps its
/// best rank.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub source: IndexKind,
    pub entries: Vec<(ChunkId, usize)>,
}

impl RankedList {
    pub fn new(source: IndexKind, entries: Vec<(ChunkId, usize)>) -> Self {
        Self { source, entries }
    }

    pub fn from_results(source: IndexKind, results: &[QueryResult]) -> Self {
        Self { source, entries: results.iter().map(|r| (r.chunk_id.clone(), r.rank)).collect() }
    }
}

pub fn rank_contribution(k: u32, rank: usize) -> f64 {
    1.0 / (f64::from(k) + rank as f64)
}

/// Fuse `lists` and keep the best `top_k`.
///
/// Order: combined score descending, then lower minimum rank, then chunk id.
/// Each chunk's contributions are summed in (rank, source) order so the
/// result does not depend on the order of `lists`.
pub fn fuse(lists: &[RankedList], config: RrfConfig, top_k: usize) -> Vec<FusedResult> {
    let mut ranks: HashMap<&str, Vec<ContributingRank>> = HashMap::new();
    for list in lists {
        for (id, rank) in &list.entries {
            let contributions = ranks.entry(id.as_str()).or_default();
            match contributions.iter_mut().find(|c| c.source == list.source) {
                Some(existing) => existing.rank = existing.rank.min(*rank),
                None => contributions.push(ContributingRank { source: list.source, rank: *rank }),
            }
        }
    }

    let mut fused: Vec<FusedResult> = ranks
        .into_iter()
        .map(|(id, mut contributing_ranks)| {
            contributing_ranks.sort_by_key(|c| (c.rank, c.source));
            let combined_score = contributing_ranks.iter().map(|c| rank_contribution(config.k, c.rank)).sum();
            FusedResult { chunk_id: id.to_string(), combined_score, contributing_ranks }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then_with(|| a.min_rank().cmp(&b.min_rank()))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    let candidates = fused.len();
    fused.truncate(top_k);
    debug!(lists = lists.len(), candidates, returned = fused.len(), k = config.k, "rrf fusion");
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn list(source: IndexKind, ids: &[&str]) -> RankedList {
        RankedList::new(source, ids.iter().enumerate().map(|(i, id)| (id.to_string(), i + 1)).collect())
    }

    fn ids(fused: &[FusedResult]) -> Vec<&str> {
        fused.iter().map(|f| f.chunk_id.as_str()).collect()
    }

    #[test]
    fn worked_example() {
        let dense = list(IndexKind::Dense, &["A", "B", "C"]);
        let sparse = list(IndexKind::Sparse, &["B", "D", "A"]);
        let fused = fuse(&[dense, sparse], RrfConfig::default(), 10);
        assert_eq!(ids(&fused), vec!["B", "A", "D", "C"]);

        let b = &fused[0];
        assert!((b.combined_score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert_eq!(b.rank_in(IndexKind::Dense), Some(2));
        assert_eq!(b.rank_in(IndexKind::Sparse), Some(1));
        assert_eq!(fused[3].contributing_ranks, vec![ContributingRank { source: IndexKind::Dense, rank: 3 }]);
    }

    #[test]
    fn chunk_in_both_lists_beats_single_list_at_equal_rank() {
        let dense = list(IndexKind::Dense, &["both", "dense_only"]);
        let sparse = list(IndexKind::Sparse, &["both", "sparse_only"]);
        let fused = fuse(&[dense, sparse], RrfConfig::default(), 10);
        assert_eq!(fused[0].chunk_id, "both");
        assert!(fused[0].combined_score > fused[1].combined_score);
    }

    #[test]
    fn equal_scores_prefer_lower_min_rank_then_id() {
        // With k = 0, rank 2 in both lists scores 1/2 + 1/2 = 1/1.
        let dense = list(IndexKind::Dense, &["y", "x"]);
        let sparse = list(IndexKind::Sparse, &["z", "x"]);
        let fused = fuse(&[dense, sparse], RrfConfig { k: 0 }, 10);
        assert_eq!(ids(&fused), vec!["y", "z", "x"]);
        assert_eq!(fused[0].combined_score, fused[2].combined_score);
    }

    #[test]
    fn truncates_and_handles_empty_input() {
        assert!(fuse(&[], RrfConfig::default(), 5).is_empty());
        let dense = list(IndexKind::Dense, &["a", "b", "c"]);
        assert_eq!(ids(&fuse(&[dense], RrfConfig::default(), 2)), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_entries_keep_best_rank() {
        let dense = RankedList::new(IndexKind::Dense, vec![("a".into(), 3), ("a".into(), 1)]);
        let fused = fuse(&[dense], RrfConfig::default(), 10);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].min_rank(), 1);
    }

    fn ranking(source: IndexKind) -> impl Strategy<Value = RankedList> {
        prop::sample::subsequence((0..12).map(|i| format!("c{i}")).collect::<Vec<_>>(), 0..12)
            .prop_shuffle()
            .prop_map(move |ids| {
                RankedList::new(source, ids.into_iter().enumerate().map(|(i, id)| (id, i + 1)).collect())
            })
    }

    proptest! {
        #[test]
        fn fusion_is_commutative(dense in ranking(IndexKind::Dense), sparse in ranking(IndexKind::Sparse), k in 0u32..100, top_k in 0usize..15) {
            let forward = fuse(&[dense.clone(), sparse.clone()], RrfConfig { k }, top_k);
            let backward = fuse(&[sparse, dense], RrfConfig { k }, top_k);
            prop_assert_eq!(forward, backward);
        }
    }
}
