//! HNSW graph over unit vectors, rebuilt from the live table at compaction.
//!
//! Node ids are table slots. Slots written after the build are not in the
//! graph; callers scan them exhaustively.

use std::fmt;
use std::ops::Range;

use hnsw_rs::filter::FilterT;
use hnsw_rs::prelude::{DistDot, Hnsw};
use tracing::debug;

const EF_CONSTRUCTION: usize = 200;
const MAX_LAYER: usize = 16;
/// `DistDot` rejects dot products above 1 from rounding.
const DOT_SHRINK: f32 = 0.999_999;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scale `v` to unit length. Returns false for a zero vector.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}

fn shrink(v: &[f32]) -> Vec<f32> {
    v.iter().map(|x| x * DOT_SHRINK).collect()
}

pub struct AnnGraph {
    hnsw: Hnsw<'static, f32, DistDot>,
    nodes: usize,
    built_upto: usize,
}

impl fmt::Debug for AnnGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnGraph").field("nodes", &self.nodes).field("built_upto", &self.built_upto).finish_non_exhaustive()
    }
}

impl AnnGraph {
    /// Insert every `(slot, unit vector)` member. Slots at or above
    /// `total_slots` belong to the exhaustive tail.
    pub fn build<'a, I>(members: I, total_slots: usize, max_connections: usize) -> Option<Self>
    where
        I: IntoIterator<Item = (usize, &'a [f32])>,
    {
        let points: Vec<(Vec<f32>, usize)> = members.into_iter().map(|(slot, v)| (shrink(v), slot)).collect();
        if points.is_empty() {
            return None;
        }
        let hnsw = Hnsw::new(max_connections, points.len(), MAX_LAYER, EF_CONSTRUCTION, DistDot);
        let with_ids: Vec<(&Vec<f32>, usize)> = points.iter().map(|(v, slot)| (v, *slot)).collect();
        hnsw.parallel_insert(&with_ids);
        debug!(nodes = points.len(), max_connections, "built ann graph");
        Some(Self { hnsw, nodes: points.len(), built_upto: total_slots })
    }

    pub fn len(&self) -> usize {
        self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes == 0
    }

    /// Up to `k` graph nodes closest to `query` among those `admit` accepts.
    pub fn nearest(&self, query: &[f32], k: usize, ef_search: usize, admit: &dyn Fn(usize) -> bool) -> Vec<usize> {
        let accept = |id: &usize| admit(*id);
        let filter: &dyn FilterT = &accept;
        self.hnsw.search_filter(&shrink(query), k, ef_search.max(k), Some(filter)).into_iter().map(|n| n.d_id).collect()
    }

    /// Slots written since the build.
    pub fn tail(&self, total_slots: usize) -> Range<usize> {
        self.built_upto..total_slots.max(self.built_upto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(x: f32, y: f32, z: f32) -> Vec<f32> {
        let mut v = vec![x, y, z];
        normalize(&mut v);
        v
    }

    #[test]
    fn finds_the_closest_admitted_nodes() {
        let mut vectors = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            vectors.push(unit(1.0, jitter, 0.0));
            vectors.push(unit(0.0, jitter, 1.0));
        }
        let members = vectors.iter().enumerate().map(|(i, v)| (i, v.as_slice()));
        let graph = AnnGraph::build(members, vectors.len(), 16).unwrap();
        assert_eq!(graph.len(), 40);

        let mut near = graph.nearest(&[1.0, 0.0, 0.0], 5, 64, &|_| true);
        near.sort_unstable();
        assert!(near.iter().all(|slot| slot % 2 == 0), "{near:?}");

        let odd = graph.nearest(&[1.0, 0.0, 0.0], 3, 64, &|slot| slot % 2 == 1);
        assert_eq!(odd.len(), 3);
        assert!(odd.iter().all(|slot| slot % 2 == 1));
        assert_eq!(graph.tail(42), 40..42);
    }

    #[test]
    fn empty_member_set_builds_nothing() {
        assert!(AnnGraph::build(std::iter::empty::<(usize, &[f32])>(), 0, 16).is_none());
    }
}
