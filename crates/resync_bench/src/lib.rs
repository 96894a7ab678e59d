//! Benchmark utilities.

#![warn(missing_docs)]

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded generator so runs are comparable.
pub fn rng() -> StdRng {
    StdRng::seed_from_u64(0x5eed)
}

/// Generate random payload bytes of the specified size.
pub fn random_payload(rng: &mut impl Rng, size: usize) -> Vec<u8> {
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` record keys.
pub fn record_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("progress_{i}")).collect()
}

/// A skewed access trace over `key_space` keys: low indices are hot.
///
/// Weights fall off as `1/(i+1)`, roughly the shape of lesson and media
/// lookups where a few resources dominate.
pub fn skewed_trace(rng: &mut impl Rng, key_space: usize, len: usize) -> Vec<usize> {
    let weights: Vec<f64> = (0..key_space).map(|i| 1.0 / (i as f64 + 1.0)).collect();
    match WeightedIndex::new(&weights) {
        Ok(dist) => (0..len).map(|_| dist.sample(rng)).collect(),
        Err(_) => Vec::new(),
    }
}
