//! The dense update: store the whole tensor.
//!
//! Every incremental chain terminates here; `apply` is just a read of the
//! stored value.

use async_trait::async_trait;
use theta_lsh::Signature;
use theta_tensor::Tensor;

use crate::error::{Result, ThetaError};
use crate::metadata::LfsMetadata;
use crate::metadata::ParamMetadata;
use crate::updates::{fetch_group, store_group, Update, UpdateContext};
use crate::utils::ParamName;

pub const NAME: &str = "dense";

const PARAMETER_KEY: &str = "parameter";

/// An update where all parameters are changed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseUpdate;

#[async_trait]
impl Update for DenseUpdate {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write(
        &self,
        new_value: &Tensor,
        name: &ParamName,
        _prev: Option<&ParamMetadata>,
        ctx: &UpdateContext,
    ) -> Result<(LfsMetadata, Option<Signature>)> {
        tracing::debug!(param = %name, "writing dense update");
        let mut group = std::collections::BTreeMap::new();
        group.insert(PARAMETER_KEY.to_string(), new_value.clone());
        Ok((store_group(&group, ctx).await?, None))
    }

    async fn apply(
        &self,
        record: &ParamMetadata,
        name: &ParamName,
        ctx: &UpdateContext,
    ) -> Result<Tensor> {
        tracing::debug!(param = %name, "applying dense update");
        let mut group = fetch_group(record, ctx).await?;
        group.remove(PARAMETER_KEY).ok_or_else(|| {
            ThetaError::metadata_decode(
                Some(&ctx.path),
                Some(&name.to_string()),
                "dense blob is missing its parameter tensor",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::testing::context;

    #[tokio::test]
    async fn write_then_apply_is_identity() {
        let (ctx, _repo, _store) = context();
        let name = ParamName::from_path("a");
        let value = Tensor::from_f32(vec![2, 2], &[1.0, -2.0, 3.5, 0.0]).unwrap();

        let handler = DenseUpdate;
        let (lfs, hash) = handler.write(&value, &name, None, &ctx).await.unwrap();
        assert!(hash.is_none());

        let record = crate::metadata::param_metadata(
            crate::metadata::TensorMetadata::from_tensor(&value, &ctx.lsh),
            lfs,
            NAME,
            "",
        );
        let applied = handler.apply(&record, &name, &ctx).await.unwrap();
        assert_eq!(applied, value);
    }

    #[tokio::test]
    async fn identical_values_share_a_blob() {
        let (ctx, _repo, store) = context();
        let value = Tensor::from_f64(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let a = DenseUpdate
            .write(&value, &ParamName::from_path("a"), None, &ctx)
            .await
            .unwrap();
        let b = DenseUpdate
            .write(&value, &ParamName::from_path("b"), None, &ctx)
            .await
            .unwrap();
        assert_eq!(a.0.oid, b.0.oid);
        assert_eq!(store.len(), 1);
    }
}
