//! Merge strategies that select one side's record unchanged.

use async_trait::async_trait;

use crate::error::Result;
use crate::merges::{DiffState, Merge, MergeArgs, MergeContext, MergeSides};
use crate::metadata::ParamMetadata;
use crate::utils::ParamName;

/// Keep our change to the parameter.
pub struct TakeOurs;

#[async_trait]
impl Merge for TakeOurs {
    fn name(&self) -> &'static str {
        "take-ours"
    }

    fn description(&self) -> &'static str {
        "Use our change to the parameter."
    }

    fn inactive_states(&self) -> &'static [DiffState] {
        // If only they touched it, "ours" makes no sense.
        &[DiffState::ChangedB, DiffState::AddedB, DiffState::DeletedB]
    }

    async fn merge(
        &self,
        _name: &ParamName,
        sides: &MergeSides<'_>,
        _mctx: &MergeContext,
        _args: &MergeArgs,
    ) -> Result<Option<ParamMetadata>> {
        Ok(sides.a.cloned())
    }
}

/// Keep their change to the parameter.
pub struct TakeTheirs;

#[async_trait]
impl Merge for TakeTheirs {
    fn name(&self) -> &'static str {
        "take-theirs"
    }

    fn description(&self) -> &'static str {
        "Use their change to the parameter."
    }

    fn inactive_states(&self) -> &'static [DiffState] {
        &[DiffState::ChangedA, DiffState::AddedA, DiffState::DeletedA]
    }

    async fn merge(
        &self,
        _name: &ParamName,
        sides: &MergeSides<'_>,
        _mctx: &MergeContext,
        _args: &MergeArgs,
    ) -> Result<Option<ParamMetadata>> {
        Ok(sides.b.cloned())
    }
}

/// Keep the ancestor's parameter.
pub struct TakeOriginal;

#[async_trait]
impl Merge for TakeOriginal {
    fn name(&self) -> &'static str {
        "take-original"
    }

    fn description(&self) -> &'static str {
        "Use the original parameter."
    }

    fn inactive_states(&self) -> &'static [DiffState] {
        &[]
    }

    async fn merge(
        &self,
        _name: &ParamName,
        sides: &MergeSides<'_>,
        _mctx: &MergeContext,
        _args: &MergeArgs,
    ) -> Result<Option<ParamMetadata>> {
        Ok(sides.o.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_ours_inactive_for_their_changes() {
        assert!(!TakeOurs.active_for(DiffState::ChangedB));
        assert!(TakeOurs.active_for(DiffState::ChangedA));
        assert!(TakeOurs.active_for(DiffState::ChangedBoth));
        assert!(TakeOriginal.active_for(DiffState::ChangedBoth));
    }
}
