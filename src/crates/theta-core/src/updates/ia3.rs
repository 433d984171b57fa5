//! The activation-scaling (ia3) update: `new ~= prev * vector`.
//!
//! The stored payload is a single broadcastable vector. When no side-loaded
//! vector is supplied it is inferred by averaging element-wise ratios
//! `new / prev` over the broadcast axes (every axis but the last). Positions
//! where the denominator is zero contribute nothing to the average, and a
//! bucket whose denominators are all zero scales to zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use theta_lsh::Signature;
use theta_tensor::{Dtype, Tensor};

use crate::error::{Result, ThetaError};
use crate::metadata::LfsMetadata;
use crate::metadata::ParamMetadata;
use crate::updates::{
    fetch_group, load_value_at_commit, require_prior_value, store_group, Update, UpdateContext,
    UpdateData,
};
use crate::utils::ParamName;

pub const NAME: &str = "ia3";

const VECTOR_KEY: &str = "ia3";

/// An update where activations are scaled along the last axis.
#[derive(Debug, Default)]
pub struct Ia3Update {
    data: Option<Arc<UpdateData>>,
}

impl Ia3Update {
    pub fn new(data: Option<Arc<UpdateData>>) -> Self {
        Self { data }
    }
}

/// Infer the scaling vector from a pair of same-shape tensors.
fn infer_scaler(new_value: &Tensor, prev_value: &Tensor) -> Result<Tensor> {
    if new_value.shape() != prev_value.shape() {
        return Err(ThetaError::Tensor(
            theta_tensor::TensorError::DimensionMismatch {
                lhs: new_value.shape().to_vec(),
                rhs: prev_value.shape().to_vec(),
            },
        ));
    }
    let last = new_value.shape().last().copied().unwrap_or(1);
    let mut sums = vec![0.0f64; last];
    let mut counts = vec![0usize; last];
    for (idx, (n, p)) in new_value
        .to_f64s()
        .into_iter()
        .zip(prev_value.to_f64s())
        .enumerate()
    {
        if p != 0.0 {
            sums[idx % last] += n / p;
            counts[idx % last] += 1;
        }
    }
    let vector: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(sum, count)| if *count > 0 { sum / *count as f64 } else { 0.0 })
        .collect();
    let mut shape = vec![1usize; new_value.ndim().max(1)];
    *shape.last_mut().unwrap() = last;
    Ok(Tensor::from_f64s(shape, Dtype::F64, &vector)?)
}

#[async_trait]
impl Update for Ia3Update {
    fn name(&self) -> &'static str {
        NAME
    }

    fn will_update(&self, name: &ParamName) -> bool {
        self.data.as_ref().is_some_and(|d| d.covers(name))
    }

    async fn write(
        &self,
        new_value: &Tensor,
        name: &ParamName,
        prev: Option<&ParamMetadata>,
        ctx: &UpdateContext,
    ) -> Result<(LfsMetadata, Option<Signature>)> {
        let prev_value = require_prior_value(prev, name, ctx).await?;
        let vector = match self
            .data
            .as_ref()
            .filter(|d| d.covers(name))
            .map(|d| d.fields_for(name))
        {
            Some(fields) => fields.get(VECTOR_KEY).cloned().ok_or_else(|| {
                ThetaError::metadata_decode(
                    Some(&ctx.path),
                    Some(&name.to_string()),
                    "side-loaded ia3 update is missing its vector",
                )
            })?,
            None => infer_scaler(new_value, &prev_value)?,
        };
        tracing::debug!(param = %name, "writing ia3 update");
        let reconstructed = prev_value.mul_broadcast(&vector)?;
        let group = BTreeMap::from([(VECTOR_KEY.to_string(), vector)]);
        let lfs = store_group(&group, ctx).await?;
        Ok((lfs, Some(ctx.lsh.hash(&reconstructed.to_f64s()))))
    }

    async fn apply(
        &self,
        record: &ParamMetadata,
        name: &ParamName,
        ctx: &UpdateContext,
    ) -> Result<Tensor> {
        tracing::debug!(param = %name, "applying ia3 update");
        let group = fetch_group(record, ctx).await?;
        let vector = group.get(VECTOR_KEY).ok_or_else(|| {
            ThetaError::metadata_decode(
                Some(&ctx.path),
                Some(&name.to_string()),
                "ia3 blob is missing its vector",
            )
        })?;
        let prev_value =
            load_value_at_commit(&record.theta_metadata.last_commit, name, ctx).await?;
        prev_value.mul_broadcast(vector).map_err(Into::into)
    }
}
