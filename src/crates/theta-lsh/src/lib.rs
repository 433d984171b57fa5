//! # theta-lsh
//!
//! Locality-sensitive hashing for parameter change detection. Signatures are
//! produced by [`EuclideanLsh`] over a fixed-seed [`RandomnessPool`], so any
//! two processes configured with the same signature size, pool size, and
//! bucket width agree on every signature.

pub mod euclidean;
pub mod pool;

pub use euclidean::{EuclideanLsh, Signature};
pub use pool::{RandomnessPool, POOL_SEED};
