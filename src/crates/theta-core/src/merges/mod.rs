//! Per-parameter merge strategy plug-ins.
//!
//! A merge driver sees three metadata documents: ours (A), theirs (B), and
//! the common ancestor (O). Each parameter is classified into a
//! [`DiffState`] and resolved by a strategy plug-in; strategies declare the
//! states they are inactive for, and may return `None` to decline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use theta_tensor::Tensor;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::metadata::{Metadata, ParamMetadata};
use crate::updates::{get_update_handler, UpdateContext};
use crate::utils::ParamName;

pub mod average;
pub mod take;

/// How a parameter differs across the three merge inputs.
///
/// Equality is by object-store OID, matching the document diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffState {
    Equal,
    ChangedA,
    ChangedB,
    ChangedBoth,
    AddedA,
    AddedB,
    AddedBoth,
    DeletedA,
    DeletedB,
    DeletedBoth,
}

/// Classify one parameter given its three records.
pub fn diff_state(
    a: Option<&ParamMetadata>,
    b: Option<&ParamMetadata>,
    o: Option<&ParamMetadata>,
) -> DiffState {
    let same = |x: Option<&ParamMetadata>, y: Option<&ParamMetadata>| match (x, y) {
        (Some(x), Some(y)) => x.lfs_metadata.oid == y.lfs_metadata.oid,
        _ => false,
    };
    match (a.is_some(), b.is_some(), o.is_some()) {
        (true, true, true) => match (same(a, o), same(b, o)) {
            (true, true) => DiffState::Equal,
            (false, true) => DiffState::ChangedA,
            (true, false) => DiffState::ChangedB,
            (false, false) => {
                if same(a, b) {
                    DiffState::Equal
                } else {
                    DiffState::ChangedBoth
                }
            }
        },
        (true, true, false) => DiffState::AddedBoth,
        (true, false, false) => DiffState::AddedA,
        (false, true, false) => DiffState::AddedB,
        (false, true, true) => DiffState::DeletedA,
        (true, false, true) => DiffState::DeletedB,
        (false, false, true) => DiffState::DeletedBoth,
        (false, false, false) => DiffState::Equal,
    }
}

/// The three records and documents a strategy sees for one parameter.
pub struct MergeSides<'a> {
    pub a: Option<&'a ParamMetadata>,
    pub b: Option<&'a ParamMetadata>,
    pub o: Option<&'a ParamMetadata>,
    pub doc_a: &'a Metadata,
    pub doc_b: &'a Metadata,
    pub doc_o: &'a Metadata,
}

/// Shared merge state: the update context plus partially materialized
/// models, so strategies that load real tensor values reuse earlier loads.
pub struct MergeContext {
    pub ctx: UpdateContext,
    /// Commit recorded as `last_commit` in freshly written records.
    pub head: String,
    pub partial_a: Mutex<HashMap<ParamName, Tensor>>,
    pub partial_b: Mutex<HashMap<ParamName, Tensor>>,
    pub partial_o: Mutex<HashMap<ParamName, Tensor>>,
}

impl MergeContext {
    pub fn new(ctx: UpdateContext, head: String) -> Self {
        Self {
            ctx,
            head,
            partial_a: Mutex::new(HashMap::new()),
            partial_b: Mutex::new(HashMap::new()),
            partial_o: Mutex::new(HashMap::new()),
        }
    }

    /// Load the real value behind a record, caching per side.
    pub async fn load_value(
        &self,
        side: &Mutex<HashMap<ParamName, Tensor>>,
        name: &ParamName,
        record: &ParamMetadata,
    ) -> Result<Tensor> {
        if let Some(cached) = side.lock().await.get(name) {
            return Ok(cached.clone());
        }
        let handler = get_update_handler(&record.theta_metadata.update_type, None)?;
        let value = handler.apply(record, name, &self.ctx).await?;
        side.lock().await.insert(name.clone(), value.clone());
        Ok(value)
    }
}

/// Strategy-specific numeric arguments (e.g. averaging coefficients).
pub type MergeArgs = BTreeMap<String, f64>;

/// A per-parameter merge resolution plug-in.
#[async_trait]
pub trait Merge: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// One-line description for diagnostics.
    fn description(&self) -> &'static str;

    /// States this strategy does not apply to.
    fn inactive_states(&self) -> &'static [DiffState];

    fn active_for(&self, state: DiffState) -> bool {
        !self.inactive_states().contains(&state)
    }

    /// Resolve one parameter; `None` means "no result" and the driver must
    /// fall back or fail.
    async fn merge(
        &self,
        name: &ParamName,
        sides: &MergeSides<'_>,
        mctx: &MergeContext,
        args: &MergeArgs,
    ) -> Result<Option<ParamMetadata>>;
}

/// Every built-in strategy, keyed by name.
pub fn all_merge_handlers() -> BTreeMap<&'static str, Arc<dyn Merge>> {
    let handlers: Vec<Arc<dyn Merge>> = vec![
        Arc::new(take::TakeOurs),
        Arc::new(take::TakeTheirs),
        Arc::new(take::TakeOriginal),
        Arc::new(average::Average::ours_theirs()),
        Arc::new(average::Average::all()),
        Arc::new(average::Average::ours_original()),
        Arc::new(average::Average::theirs_original()),
    ];
    handlers.into_iter().map(|h| (h.name(), h)).collect()
}

/// Look up a merge strategy by name.
pub fn get_merge_handler(name: &str) -> Result<Arc<dyn Merge>> {
    all_merge_handlers()
        .remove(name)
        .ok_or_else(|| crate::error::ThetaError::UnknownPlugin {
            kind: "merge",
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{LfsMetadata, TensorMetadata, ThetaMetadata};

    fn record(oid_char: char) -> ParamMetadata {
        ParamMetadata {
            tensor_metadata: TensorMetadata {
                shape: vec![1],
                dtype: "<f8".to_string(),
                hash: vec![0; 16],
            },
            lfs_metadata: LfsMetadata {
                version: crate::lfs::LFS_VERSION.to_string(),
                oid: oid_char.to_string().repeat(64),
                size: "8".to_string(),
            },
            theta_metadata: ThetaMetadata {
                update_type: "dense".to_string(),
                last_commit: String::new(),
            },
        }
    }

    #[test]
    fn diff_state_classification() {
        let o = record('o');
        let same = record('o');
        let changed = record('x');
        let other = record('y');

        assert_eq!(diff_state(Some(&same), Some(&same), Some(&o)), DiffState::Equal);
        assert_eq!(
            diff_state(Some(&changed), Some(&same), Some(&o)),
            DiffState::ChangedA
        );
        assert_eq!(
            diff_state(Some(&same), Some(&changed), Some(&o)),
            DiffState::ChangedB
        );
        assert_eq!(
            diff_state(Some(&changed), Some(&other), Some(&o)),
            DiffState::ChangedBoth
        );
        // Both sides made the identical change: not a conflict.
        assert_eq!(
            diff_state(Some(&changed), Some(&changed), Some(&o)),
            DiffState::Equal
        );
        assert_eq!(diff_state(Some(&changed), None, None), DiffState::AddedA);
        assert_eq!(diff_state(None, Some(&changed), None), DiffState::AddedB);
        assert_eq!(
            diff_state(Some(&changed), Some(&other), None),
            DiffState::AddedBoth
        );
        assert_eq!(diff_state(None, Some(&same), Some(&o)), DiffState::DeletedA);
        assert_eq!(diff_state(Some(&same), None, Some(&o)), DiffState::DeletedB);
        assert_eq!(diff_state(None, None, Some(&o)), DiffState::DeletedBoth);
    }

    #[test]
    fn registry_contains_all_builtins() {
        let handlers = all_merge_handlers();
        for name in [
            "take-ours",
            "take-theirs",
            "take-original",
            "average-ours-theirs",
            "average-all",
            "average-ours-original",
            "average-theirs-original",
        ] {
            assert!(handlers.contains_key(name), "missing {name}");
        }
        assert!(get_merge_handler("nope").is_err());
    }
}
