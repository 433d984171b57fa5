//! The clean/smudge filter driver.
//!
//! Clean turns a freshly loaded checkpoint into its metadata document; smudge
//! reconstructs the checkpoint from a document. Per-parameter work is
//! independent, so both drivers launch one cooperative task per parameter,
//! optionally bounded by a semaphore, and fail fast: the first error cancels
//! every sibling still in flight. Parameters are processed in lexicographic
//! key order and the document serializer sorts keys, so bytewise-identical
//! inputs clean to bytewise-identical documents regardless of completion
//! order.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::checkpoints::Checkpoint;
use crate::error::{Result, ThetaError};
use crate::metadata::{param_metadata, Metadata, ParamMetadata, TensorMetadata};
use crate::updates::{get_update_handler, Update, UpdateContext, UpdateData};
use crate::utils::{env, ParamName};
use theta_tensor::Tensor;

/// Driver options resolved from user input and the environment.
#[derive(Clone)]
pub struct FilterOptions {
    /// Update plug-in for changed parameters (`dense` when unset).
    pub update_type: String,
    /// Side-loaded update content, if any.
    pub update_data: Option<Arc<UpdateData>>,
    /// Serialize strictly and drop tensors eagerly.
    pub low_memory: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            update_type: crate::updates::dense::NAME.to_string(),
            update_data: None,
            low_memory: false,
        }
    }
}

impl FilterOptions {
    /// Resolve the options from `GIT_THETA_*` environment variables.
    pub fn from_env(ctx: &UpdateContext) -> Result<Self> {
        let update_type =
            env::var(env::UPDATE_TYPE).unwrap_or_else(|| crate::updates::dense::NAME.to_string());
        let update_data = match env::var(env::UPDATE_DATA_PATH) {
            Some(path) => Some(Arc::new(UpdateData::load(
                std::path::Path::new(&path),
                &ctx.serializer,
            )?)),
            None => None,
        };
        Ok(Self {
            update_type,
            update_data,
            low_memory: env::flag(env::LOW_MEMORY),
        })
    }
}

fn concurrency_limit(max_concurrency: i64) -> Option<Arc<Semaphore>> {
    (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency as usize)))
}

/// Convert a checkpoint into its metadata document.
pub async fn clean(
    checkpoint: Checkpoint,
    ctx: &UpdateContext,
    options: &FilterOptions,
) -> Result<Metadata> {
    let prev = Metadata::from_commit(&*ctx.repo, &ctx.path, "HEAD").await?;
    prev.validate_signature_size(ctx.lsh.signature_size())?;
    let head = ctx.repo.head_sha().await?.unwrap_or_default();
    let handler = get_update_handler(&options.update_type, options.update_data.clone())?;

    let mut result = Metadata::new();
    if options.low_memory {
        tracing::warn!(
            "running in low-memory mode: no concurrency, parameters are freed as processed"
        );
        let mut params = checkpoint.into_params();
        while let Some((name, value)) = params.pop_first() {
            let record = clean_param(&name, value, &prev, &head, handler.as_ref(), ctx).await?;
            result.insert(name, record);
        }
        return Ok(result);
    }

    let semaphore = concurrency_limit(ctx.config.max_concurrency);
    let tasks = checkpoint.into_params().into_iter().map(|(name, value)| {
        let semaphore = semaphore.clone();
        let prev = &prev;
        let head = head.as_str();
        let handler = handler.as_ref();
        async move {
            let _permit = match &semaphore {
                Some(s) => Some(s.acquire().await.map_err(|e| {
                    ThetaError::config(format!("concurrency limiter closed: {e}"))
                })?),
                None => None,
            };
            let record = clean_param(&name, value, prev, head, handler, ctx).await?;
            Ok::<_, ThetaError>((name, record))
        }
    });
    for (name, record) in futures::future::try_join_all(tasks).await? {
        result.insert(name, record);
    }
    Ok(result)
}

/// The per-parameter clean protocol.
async fn clean_param(
    name: &ParamName,
    new_value: Tensor,
    prev: &Metadata,
    head: &str,
    handler: &dyn Update,
    ctx: &UpdateContext,
) -> Result<ParamMetadata> {
    tracing::debug!(param = %name, "cleaning parameter");
    let mut tm_new = TensorMetadata::from_tensor(&new_value, &ctx.lsh);
    let prev_record = prev.get(name);

    // An unchanged parameter keeps its record verbatim: same shape and
    // dtype, no side-loaded update pending, and an LSH distance inside the
    // tolerance (or a passing element-wise check inside the gray zone).
    if let Some(pm) = prev_record {
        if pm.tensor_metadata.shape == tm_new.shape
            && pm.tensor_metadata.dtype == tm_new.dtype
            && !handler.will_update(name)
        {
            let distance = ctx.lsh.distance(&pm.tensor_metadata.hash, &tm_new.hash);
            if distance < ctx.config.parameter_atol {
                tracing::debug!(param = %name, distance, "unchanged by signature");
                return Ok(pm.clone());
            } else if distance < ctx.config.lsh_threshold {
                let prev_handler = get_update_handler(&pm.theta_metadata.update_type, None)?;
                let prev_value = prev_handler
                    .apply(pm, name, ctx)
                    .await
                    .map_err(|e| ThetaError::plugin(pm.theta_metadata.update_type.clone(), name, e))?;
                if prev_value.allclose(
                    &new_value,
                    ctx.config.parameter_rtol,
                    ctx.config.parameter_atol,
                ) {
                    tracing::debug!(param = %name, distance, "unchanged by element-wise check");
                    return Ok(pm.clone());
                }
            }
        }
    }

    // Changed (or new): hand the tensor to the update plug-in. Incremental
    // plug-ins report the signature of the reconstructed value so the next
    // clean compares against what smudge will actually produce.
    let (lfs_metadata, override_hash) = handler
        .write(&new_value, name, prev_record, ctx)
        .await
        .map_err(|e| ThetaError::plugin(handler.name(), name, e))?;
    if let Some(hash) = override_hash {
        tm_new.hash = hash;
    }
    Ok(param_metadata(tm_new, lfs_metadata, handler.name(), head))
}

/// Reconstruct a checkpoint from its metadata document.
pub async fn smudge(metadata: Metadata, ctx: &UpdateContext) -> Result<Checkpoint> {
    metadata.validate_signature_size(ctx.lsh.signature_size())?;
    let semaphore = concurrency_limit(ctx.config.max_concurrency);
    let tasks = metadata.into_iter().map(|(name, record)| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = match &semaphore {
                Some(s) => Some(s.acquire().await.map_err(|e| {
                    ThetaError::config(format!("concurrency limiter closed: {e}"))
                })?),
                None => None,
            };
            tracing::debug!(param = %name, "smudging parameter");
            let handler = get_update_handler(&record.theta_metadata.update_type, None)?;
            let value = handler
                .apply(&record, &name, ctx)
                .await
                .map_err(|e| ThetaError::plugin(record.theta_metadata.update_type.clone(), &name, e))?;
            Ok::<_, ThetaError>((name, value))
        }
    });
    let mut checkpoint = Checkpoint::new();
    for (name, value) in futures::future::try_join_all(tasks).await? {
        checkpoint.insert(name, value);
    }
    Ok(checkpoint)
}
