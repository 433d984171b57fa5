//! Deterministic pre-computed randomness.
//!
//! The Euclidean LSH needs a Gaussian hyperplane entry for every
//! `(feature, signature)` pair of an unboundedly large virtual matrix. The
//! pool holds `pool_size` standard-normal samples plus one 64-bit offset per
//! signature position, all drawn from a single fixed-seed generator, and
//! serves matrix entries as `pool[(feature ^ offset) % pool_size]`. Two
//! repositories configured identically therefore hash identically, without
//! shipping pool data on disk.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Seed for the pool generator. Changing it is a repository-wide breaking
/// change: every stored signature becomes incomparable.
pub const POOL_SEED: u64 = 0x6769_745f_7468_6574;

/// Pre-computed Gaussian samples and per-signature-position offsets.
#[derive(Debug, Clone)]
pub struct RandomnessPool {
    pool: Vec<f64>,
    offsets: Vec<u64>,
}

impl RandomnessPool {
    /// Build a pool of `pool_size` samples serving `signature_size`
    /// signature positions.
    pub fn new(pool_size: usize, signature_size: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(POOL_SEED);
        let pool: Vec<f64> = (0..pool_size)
            .map(|_| rng.sample(StandardNormal))
            .collect();
        let offsets: Vec<u64> = (0..signature_size).map(|_| rng.gen()).collect();
        Self { pool, offsets }
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn signature_size(&self) -> usize {
        self.offsets.len()
    }

    /// Entry of the virtual hyperplane matrix at `(feature_idx, signature_idx)`.
    #[inline]
    pub fn hyperplane_element(&self, feature_idx: usize, signature_idx: usize) -> f64 {
        let mixed = feature_idx as u64 ^ self.offsets[signature_idx];
        self.pool[(mixed % self.pool.len() as u64) as usize]
    }
}
