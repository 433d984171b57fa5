//! # theta-core
//!
//! The clean/smudge pipeline behind git-theta: track very large ML model
//! checkpoints in git by replacing them with compact metadata documents and
//! keeping tensor bytes in a content-addressed object store.
//!
//! On *clean*, a checkpoint plug-in flattens the input into a `name ->
//! tensor` map and the [`filters`] driver decides, per parameter, whether
//! anything materially changed — first by comparing LSH signatures, then
//! (inside a gray zone) element-wise. Unchanged parameters reuse their prior
//! record verbatim; changed ones are handed to an [`updates`] plug-in that
//! stores either the full tensor or a delta against the previous value. On
//! *smudge*, each record's plug-in reconstructs its tensor, walking
//! `last_commit` pointers back to a dense record where needed.
//!
//! All context (repository access, object store, LSH hasher, configuration)
//! is carried explicitly in [`updates::UpdateContext`]; there is no hidden
//! global state.

pub mod api;
pub mod checkpoints;
pub mod config;
pub mod error;
pub mod filters;
pub mod git;
pub mod ledger;
pub mod lfs;
pub mod merges;
pub mod metadata;
pub mod params;
pub mod updates;
pub mod utils;

pub use checkpoints::Checkpoint;
pub use config::{RepoConfig, ThetaConfig};
pub use error::{Result, ThetaError};
pub use filters::{clean, smudge, FilterOptions};
pub use ledger::CommitLedger;
pub use metadata::{Metadata, ParamMetadata};
pub use updates::UpdateContext;
pub use utils::ParamName;

use std::sync::Arc;

use theta_lsh::EuclideanLsh;

/// Build the LSH hasher a repository's configuration describes.
///
/// The signature bucket width is the parameter tolerance: a one-bucket
/// disagreement then sits right at the edge of "materially changed".
pub fn lsh_from_config(config: &RepoConfig) -> Arc<EuclideanLsh> {
    Arc::new(EuclideanLsh::new(
        config.lsh_signature_size,
        config.parameter_atol,
        config.lsh_pool_size,
    ))
}
