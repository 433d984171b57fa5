//! Merge strategies that average real parameter values.
//!
//! The participating sides' tensors are loaded through their update
//! plug-ins, combined as a convex combination, and re-serialized as a dense
//! update. Coefficients come from strategy arguments (`ours`, `theirs`,
//! `original`) and are normalized so they always sum to one.

use async_trait::async_trait;
use theta_tensor::Tensor;

use crate::error::{Result, ThetaError};
use crate::merges::{DiffState, Merge, MergeArgs, MergeContext, MergeSides};
use crate::metadata::{param_metadata, ParamMetadata, TensorMetadata};
use crate::updates::{dense, get_update_handler};
use crate::utils::ParamName;

/// Which merge inputs participate in the average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Ours,
    Theirs,
    Original,
}

impl Side {
    fn coefficient_key(&self) -> &'static str {
        match self {
            Side::Ours => "ours",
            Side::Theirs => "theirs",
            Side::Original => "original",
        }
    }
}

/// A convex-combination merge over a fixed set of sides.
pub struct Average {
    name: &'static str,
    description: &'static str,
    sides: &'static [Side],
    inactive: &'static [DiffState],
}

impl Average {
    pub fn ours_theirs() -> Self {
        Self {
            name: "average-ours-theirs",
            description: "Average our and their parameter values.",
            sides: &[Side::Ours, Side::Theirs],
            inactive: &[
                DiffState::DeletedA,
                DiffState::DeletedB,
                DiffState::DeletedBoth,
            ],
        }
    }

    pub fn all() -> Self {
        Self {
            name: "average-all",
            description: "Average our, their, and the original parameter values.",
            sides: &[Side::Ours, Side::Theirs, Side::Original],
            inactive: &[
                DiffState::AddedA,
                DiffState::AddedB,
                DiffState::AddedBoth,
                DiffState::DeletedA,
                DiffState::DeletedB,
                DiffState::DeletedBoth,
            ],
        }
    }

    pub fn ours_original() -> Self {
        Self {
            name: "average-ours-original",
            description: "Average our parameter value with the original.",
            sides: &[Side::Ours, Side::Original],
            inactive: &[
                DiffState::AddedA,
                DiffState::AddedB,
                DiffState::AddedBoth,
                DiffState::DeletedA,
                DiffState::DeletedB,
                DiffState::DeletedBoth,
            ],
        }
    }

    pub fn theirs_original() -> Self {
        Self {
            name: "average-theirs-original",
            description: "Average their parameter value with the original.",
            sides: &[Side::Theirs, Side::Original],
            inactive: &[
                DiffState::AddedA,
                DiffState::AddedB,
                DiffState::AddedBoth,
                DiffState::DeletedA,
                DiffState::DeletedB,
                DiffState::DeletedBoth,
            ],
        }
    }
}

#[async_trait]
impl Merge for Average {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn inactive_states(&self) -> &'static [DiffState] {
        self.inactive
    }

    async fn merge(
        &self,
        name: &ParamName,
        sides: &MergeSides<'_>,
        mctx: &MergeContext,
        args: &MergeArgs,
    ) -> Result<Option<ParamMetadata>> {
        let mut values: Vec<(Tensor, f64)> = Vec::with_capacity(self.sides.len());
        for side in self.sides {
            let (record, cache) = match side {
                Side::Ours => (sides.a, &mctx.partial_a),
                Side::Theirs => (sides.b, &mctx.partial_b),
                Side::Original => (sides.o, &mctx.partial_o),
            };
            let Some(record) = record else {
                // A participating side is absent: this strategy has nothing
                // sensible to produce.
                return Ok(None);
            };
            let value = mctx.load_value(cache, name, record).await?;
            let coefficient = args
                .get(side.coefficient_key())
                .copied()
                .unwrap_or(1.0 / self.sides.len() as f64);
            values.push((value, coefficient));
        }

        let total: f64 = values.iter().map(|(_, c)| c).sum();
        if total <= 0.0 {
            return Err(ThetaError::config(format!(
                "averaging coefficients for {} must sum to a positive value",
                self.name
            )));
        }

        let mut combined = vec![0.0f64; values[0].0.numel()];
        for (tensor, coefficient) in &values {
            if tensor.shape() != values[0].0.shape() {
                return Err(ThetaError::Tensor(
                    theta_tensor::TensorError::DimensionMismatch {
                        lhs: values[0].0.shape().to_vec(),
                        rhs: tensor.shape().to_vec(),
                    },
                ));
            }
            for (slot, v) in combined.iter_mut().zip(tensor.to_f64s()) {
                *slot += v * coefficient / total;
            }
        }
        let merged = values[0].0.with_values(&combined)?;

        // Re-serialize the result as a dense update so the merged record has
        // no dependency on either branch's history.
        let handler = get_update_handler(dense::NAME, None)?;
        let (lfs, _) = handler
            .write(&merged, name, None, &mctx.ctx)
            .await
            .map_err(|e| ThetaError::plugin(dense::NAME, name, e))?;
        Ok(Some(param_metadata(
            TensorMetadata::from_tensor(&merged, &mctx.ctx.lsh),
            lfs,
            dense::NAME,
            &mctx.head,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::updates::testing::{commit_dense, context};

    #[tokio::test]
    async fn averages_two_sides_evenly() {
        let (ctx, repo, _store) = context();
        let name = ParamName::from_path("w");
        let ours_value = Tensor::from_f64(vec![2], &[1.0, 3.0]).unwrap();
        let theirs_value = Tensor::from_f64(vec![2], &[3.0, 5.0]).unwrap();
        let ours = commit_dense(&ctx, &repo, &"a".repeat(40), &name, &ours_value).await;
        let theirs = commit_dense(&ctx, &repo, &"b".repeat(40), &name, &theirs_value).await;

        let empty = Metadata::new();
        let sides = MergeSides {
            a: Some(&ours),
            b: Some(&theirs),
            o: None,
            doc_a: &empty,
            doc_b: &empty,
            doc_o: &empty,
        };
        let mctx = MergeContext::new(ctx.clone(), "c".repeat(40));
        let merged = Average::ours_theirs()
            .merge(&name, &sides, &mctx, &MergeArgs::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.theta_metadata.update_type, "dense");

        let handler = get_update_handler(dense::NAME, None).unwrap();
        let value = handler.apply(&merged, &name, &ctx).await.unwrap();
        assert_eq!(value.to_f64s(), vec![2.0, 4.0]);
    }

    #[tokio::test]
    async fn weighted_average_uses_coefficients() {
        let (ctx, repo, _store) = context();
        let name = ParamName::from_path("w");
        let ours_value = Tensor::from_f64(vec![1], &[0.0]).unwrap();
        let theirs_value = Tensor::from_f64(vec![1], &[4.0]).unwrap();
        let ours = commit_dense(&ctx, &repo, &"d".repeat(40), &name, &ours_value).await;
        let theirs = commit_dense(&ctx, &repo, &"e".repeat(40), &name, &theirs_value).await;

        let empty = Metadata::new();
        let sides = MergeSides {
            a: Some(&ours),
            b: Some(&theirs),
            o: None,
            doc_a: &empty,
            doc_b: &empty,
            doc_o: &empty,
        };
        let mctx = MergeContext::new(ctx.clone(), "f".repeat(40));
        let mut args = MergeArgs::new();
        args.insert("ours".to_string(), 3.0);
        args.insert("theirs".to_string(), 1.0);
        let merged = Average::ours_theirs()
            .merge(&name, &sides, &mctx, &args)
            .await
            .unwrap()
            .unwrap();
        let handler = get_update_handler(dense::NAME, None).unwrap();
        let value = handler.apply(&merged, &name, &ctx).await.unwrap();
        assert_eq!(value.to_f64s(), vec![1.0]);
    }

    #[test]
    fn average_ours_original_inactive_for_deleted_b() {
        // Averaging with a deleted parameter doesn't make sense: ours
        // changed while theirs deleted must stay an unresolved conflict.
        let strategy = Average::ours_original();
        assert!(!strategy.active_for(DiffState::DeletedA));
        assert!(!strategy.active_for(DiffState::DeletedB));
        assert!(!strategy.active_for(DiffState::DeletedBoth));
        assert!(strategy.active_for(DiffState::ChangedBoth));
    }

    #[test]
    fn average_theirs_original_inactive_for_deleted_a() {
        let strategy = Average::theirs_original();
        assert!(!strategy.active_for(DiffState::DeletedA));
        assert!(!strategy.active_for(DiffState::DeletedB));
        assert!(!strategy.active_for(DiffState::DeletedBoth));
        assert!(strategy.active_for(DiffState::ChangedBoth));
    }

    #[test]
    fn every_average_excludes_all_deletion_states() {
        for strategy in [
            Average::ours_theirs(),
            Average::all(),
            Average::ours_original(),
            Average::theirs_original(),
        ] {
            for state in [
                DiffState::DeletedA,
                DiffState::DeletedB,
                DiffState::DeletedBoth,
            ] {
                assert!(
                    !strategy.active_for(state),
                    "{} is active for {state:?}",
                    strategy.name()
                );
            }
        }
    }

    #[tokio::test]
    async fn missing_side_declines() {
        let (ctx, repo, _store) = context();
        let name = ParamName::from_path("w");
        let ours_value = Tensor::from_f64(vec![1], &[1.0]).unwrap();
        let ours = commit_dense(&ctx, &repo, &"1".repeat(40), &name, &ours_value).await;
        let empty = Metadata::new();
        let sides = MergeSides {
            a: Some(&ours),
            b: None,
            o: None,
            doc_a: &empty,
            doc_b: &empty,
            doc_o: &empty,
        };
        let mctx = MergeContext::new(ctx.clone(), "2".repeat(40));
        let result = Average::ours_theirs()
            .merge(&name, &sides, &mctx, &MergeArgs::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
