//! The sparse update: a CSR encoding of the thresholded delta.
//!
//! The delta `new - prev` is flattened, entries with magnitude below the
//! repository's `parameter_atol` are zeroed, and the survivors are stored as
//! `(data, indices, indptr, shape)` over a single-row CSR matrix. The record
//! hash reported upward is the LSH of the *reconstructed* value
//! `prev + densified(delta)`, which is what a later smudge produces.

use std::collections::BTreeMap;

use async_trait::async_trait;
use theta_lsh::Signature;
use theta_tensor::{Dtype, Tensor};

use crate::error::{Result, ThetaError};
use crate::metadata::LfsMetadata;
use crate::metadata::ParamMetadata;
use crate::updates::{
    fetch_group, load_value_at_commit, require_prior_value, store_group, Update, UpdateContext,
};
use crate::utils::ParamName;

pub const NAME: &str = "sparse";

/// An update where only some elements of a parameter are touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct SparseUpdate;

/// CSR triple of a flattened delta, plus the logical (1, numel) shape.
struct CsrDelta {
    data: Vec<f64>,
    indices: Vec<f64>,
    numel: usize,
}

fn calculate_delta(new_value: &Tensor, prev_value: &Tensor, threshold: f64) -> Result<CsrDelta> {
    let delta = new_value.sub(prev_value)?;
    let mut data = Vec::new();
    let mut indices = Vec::new();
    for (idx, v) in delta.to_f64s().into_iter().enumerate() {
        if v.abs() >= threshold {
            data.push(v);
            indices.push(idx as f64);
        }
    }
    Ok(CsrDelta {
        data,
        indices,
        numel: delta.numel(),
    })
}

fn densify(
    data: &[f64],
    indices: &[f64],
    numel: usize,
    like: &Tensor,
) -> Result<Tensor> {
    let mut dense = vec![0.0f64; numel];
    for (v, idx) in data.iter().zip(indices) {
        let idx = *idx as usize;
        if idx >= numel {
            return Err(ThetaError::integrity(format!(
                "sparse index {idx} out of bounds for {numel} elements"
            )));
        }
        dense[idx] = *v;
    }
    Tensor::from_f64s(like.shape().to_vec(), like.dtype(), &dense).map_err(Into::into)
}

#[async_trait]
impl Update for SparseUpdate {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write(
        &self,
        new_value: &Tensor,
        name: &ParamName,
        prev: Option<&ParamMetadata>,
        ctx: &UpdateContext,
    ) -> Result<(LfsMetadata, Option<Signature>)> {
        let prev_value = require_prior_value(prev, name, ctx).await?;
        let csr = calculate_delta(new_value, &prev_value, ctx.config.parameter_atol)?;
        tracing::debug!(
            param = %name,
            nnz = csr.data.len(),
            numel = csr.numel,
            "writing sparse update"
        );

        let mut group = BTreeMap::new();
        group.insert(
            "data".to_string(),
            Tensor::from_f64s(vec![csr.data.len()], Dtype::F64, &csr.data)?,
        );
        group.insert(
            "indices".to_string(),
            Tensor::from_f64s(vec![csr.indices.len()], Dtype::I64, &csr.indices)?,
        );
        group.insert(
            "indptr".to_string(),
            Tensor::from_f64s(vec![2], Dtype::I64, &[0.0, csr.data.len() as f64])?,
        );
        group.insert(
            "shape".to_string(),
            Tensor::from_f64s(vec![2], Dtype::I64, &[1.0, csr.numel as f64])?,
        );
        let lfs = store_group(&group, ctx).await?;

        let reconstructed =
            prev_value.add(&densify(&csr.data, &csr.indices, csr.numel, &prev_value)?)?;
        Ok((lfs, Some(ctx.lsh.hash(&reconstructed.to_f64s()))))
    }

    async fn apply(
        &self,
        record: &ParamMetadata,
        name: &ParamName,
        ctx: &UpdateContext,
    ) -> Result<Tensor> {
        tracing::debug!(param = %name, "applying sparse update");
        let group = fetch_group(record, ctx).await?;
        let field = |key: &str| {
            group.get(key).ok_or_else(|| {
                ThetaError::metadata_decode(
                    Some(&ctx.path),
                    Some(&name.to_string()),
                    format!("sparse blob is missing {key:?}"),
                )
            })
        };
        let data = field("data")?.to_f64s();
        let indices = field("indices")?.to_f64s();
        let shape = field("shape")?.to_f64s();
        let numel = shape.last().copied().unwrap_or(0.0) as usize;

        let prev_value =
            load_value_at_commit(&record.theta_metadata.last_commit, name, ctx).await?;
        if prev_value.numel() != numel {
            return Err(ThetaError::Tensor(
                theta_tensor::TensorError::DimensionMismatch {
                    lhs: prev_value.shape().to_vec(),
                    rhs: vec![1, numel],
                },
            ));
        }
        prev_value
            .add(&densify(&data, &indices, numel, &prev_value)?)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::testing::{commit_dense, context};

    #[tokio::test]
    async fn missing_previous_value_is_fatal() {
        let (ctx, _repo, _store) = context();
        let value = Tensor::from_f64(vec![2], &[1.0, 2.0]).unwrap();
        let err = SparseUpdate
            .write(&value, &ParamName::from_path("a"), None, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ThetaError::MissingPreviousValue { .. }));
    }

    #[tokio::test]
    async fn write_then_apply_reconstructs() {
        let (ctx, repo, _store) = context();
        let name = ParamName::from_path("a");
        let prev = Tensor::from_f64(vec![4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let prev_record = commit_dense(&ctx, &repo, &"1".repeat(40), &name, &prev).await;

        let new = Tensor::from_f64(vec![4], &[1.0, 2.0, 3.0, 4.001]).unwrap();
        let (lfs, hash) = SparseUpdate
            .write(&new, &name, Some(&prev_record), &ctx)
            .await
            .unwrap();

        // Exactly one surviving entry, at index 3.
        let blob = ctx.store.smudge(&lfs.to_pointer()).await.unwrap();
        let group = ctx.serializer.deserialize(&blob).unwrap();
        assert_eq!(group["data"].numel(), 1);
        assert!((group["data"].to_f64s()[0] - 0.001).abs() < 1e-12);
        assert_eq!(group["indices"].to_f64s(), vec![3.0]);

        let record = crate::metadata::param_metadata(
            crate::metadata::tensor_metadata_with_hash(&new, hash.unwrap()),
            lfs,
            NAME,
            &"1".repeat(40),
        );
        let applied = SparseUpdate.apply(&record, &name, &ctx).await.unwrap();
        assert!(applied.allclose(&new, 1e-9, 1e-12));
    }

    #[tokio::test]
    async fn threshold_bounds_stored_entries() {
        let (mut ctx, repo, _store) = context();
        ctx.config.parameter_atol = 0.1;
        let name = ParamName::from_path("w");
        let prev = Tensor::from_f64(vec![5], &[0.0; 5]).unwrap();
        let prev_record = commit_dense(&ctx, &repo, &"2".repeat(40), &name, &prev).await;

        // Two entries above the threshold, two below, one exactly at it.
        let new = Tensor::from_f64(vec![5], &[0.5, 0.01, -0.2, 0.09, 0.1]).unwrap();
        let (lfs, _) = SparseUpdate
            .write(&new, &name, Some(&prev_record), &ctx)
            .await
            .unwrap();
        let blob = ctx.store.smudge(&lfs.to_pointer()).await.unwrap();
        let group = ctx.serializer.deserialize(&blob).unwrap();
        let above: usize = new
            .to_f64s()
            .iter()
            .filter(|v| v.abs() >= 0.1)
            .count();
        assert!(group["data"].numel() <= above);
        assert_eq!(group["data"].numel(), 3);
    }
}
