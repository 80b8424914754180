use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

use ragdb_core::types::SparseTerms;

pub fn bucket(token: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    token.hash(&mut hasher);
    hasher.finish()
}

/// Hash weighted terms into a `dim`-sized vector and L2-normalise it.
/// Weights are dampened with `1 + ln(w)` so repeated terms do not dominate.
pub fn hashed_vector(terms: &SparseTerms, dim: usize) -> Vec<f32> {
    let mut v = vec![0f32; dim];
    for (term, &weight) in terms {
        let h = bucket(term);
        let idx = (h as usize) % dim;
        v[idx] += 1.0 + weight.max(1.0).ln();
    }
    l2_normalize(&mut v);
    v
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt().max(1e-6);
    for x in v.iter_mut() {
        *x /= norm;
    }
}
