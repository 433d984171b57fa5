//! Update representation plug-ins.
//!
//! An update plug-in decides how a changed parameter is stored: the full
//! tensor (`dense`), or a delta against the previous value (`sparse`,
//! `low-rank`, `ia3`). Incremental plug-ins reach the previous value through
//! the record's `last_commit` pointer, loading that commit's metadata and
//! delegating to whatever plug-in is named there; the chain always terminates
//! at a dense record.
//!
//! All built-ins are registered at compile time and selected by name; there
//! is no runtime code loading. Custom builds link additional plug-ins by
//! extending [`get_update_handler`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use theta_lsh::{EuclideanLsh, Signature};
use theta_tensor::Tensor;

use crate::config::RepoConfig;
use crate::error::{Result, ThetaError};
use crate::git::Repository;
use crate::lfs::ObjectStore;
use crate::metadata::LfsMetadata;
use crate::metadata::{Metadata, ParamMetadata};
use crate::params::UpdateSerializer;
use crate::utils::ParamName;

pub mod dense;
pub mod ia3;
pub mod low_rank;
pub mod sparse;

/// Everything an update plug-in needs, passed down explicitly.
#[derive(Clone)]
pub struct UpdateContext {
    pub repo: Arc<dyn Repository>,
    pub store: Arc<dyn ObjectStore>,
    pub serializer: UpdateSerializer,
    pub lsh: Arc<EuclideanLsh>,
    pub config: RepoConfig,
    /// Repo-relative path of the checkpoint file being filtered.
    pub path: String,
}

/// Side-loaded update content, keyed `"<parameter>/<field>"`.
///
/// Supplied through `GIT_THETA_UPDATE_DATA_PATH` when the update (say a
/// fine-tuning result) exists outside the checkpoint itself.
#[derive(Debug, Default)]
pub struct UpdateData {
    tensors: BTreeMap<String, Tensor>,
}

impl UpdateData {
    /// Read an update data file produced by [`format_update`].
    pub fn load(path: &Path, serializer: &UpdateSerializer) -> Result<Self> {
        let blob = std::fs::read(path)?;
        Ok(Self {
            tensors: serializer.deserialize(&blob)?,
        })
    }

    pub fn from_tensors(tensors: BTreeMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Whether the file carries fields for this parameter.
    ///
    /// A key belongs to a parameter when stripping `"<name>/"` leaves a bare
    /// field name; field names never contain `/`, which is what keeps
    /// `layers/0` from claiming `layers/0/weight`'s fields.
    pub fn covers(&self, name: &ParamName) -> bool {
        let prefix = format!("{name}/");
        self.tensors
            .keys()
            .any(|k| matches!(k.strip_prefix(&prefix), Some(field) if !field.contains('/')))
    }

    /// The fields for one parameter, with the name prefix stripped.
    pub fn fields_for(&self, name: &ParamName) -> BTreeMap<String, Tensor> {
        let prefix = format!("{name}/");
        self.tensors
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .filter(|field| !field.contains('/'))
                    .map(|field| (field.to_string(), v.clone()))
            })
            .collect()
    }
}

/// User-side helper: package one parameter's raw arrays into the on-disk
/// shape [`UpdateData::load`] expects.
pub fn format_update(
    name: &ParamName,
    fields: BTreeMap<String, Tensor>,
) -> BTreeMap<String, Tensor> {
    fields
        .into_iter()
        .map(|(field, tensor)| (format!("{name}/{field}"), tensor))
        .collect()
}

/// A parameter update representation.
#[async_trait]
pub trait Update: Send + Sync {
    /// The registry name, written into `theta_metadata.update_type`.
    fn name(&self) -> &'static str;

    /// Serialize and upload this parameter's update; return the pointer
    /// metadata and, for incremental plug-ins, the LSH signature of the
    /// *reconstructed* value (not of the stored delta).
    async fn write(
        &self,
        new_value: &Tensor,
        name: &ParamName,
        prev: Option<&ParamMetadata>,
        ctx: &UpdateContext,
    ) -> Result<(LfsMetadata, Option<Signature>)>;

    /// Recover the full tensor a record describes, recursively fetching
    /// prior values as needed.
    async fn apply(
        &self,
        record: &ParamMetadata,
        name: &ParamName,
        ctx: &UpdateContext,
    ) -> Result<Tensor>;

    /// Whether side-loaded update data covers this parameter.
    fn will_update(&self, _name: &ParamName) -> bool {
        false
    }
}

/// Look up an update plug-in by name.
pub fn get_update_handler(
    name: &str,
    update_data: Option<Arc<UpdateData>>,
) -> Result<Arc<dyn Update>> {
    match name {
        dense::NAME => Ok(Arc::new(dense::DenseUpdate)),
        sparse::NAME => Ok(Arc::new(sparse::SparseUpdate)),
        low_rank::NAME => Ok(Arc::new(low_rank::LowRankUpdate::new(update_data))),
        ia3::NAME => Ok(Arc::new(ia3::Ia3Update::new(update_data))),
        other => Err(ThetaError::UnknownPlugin {
            kind: "update",
            name: other.to_string(),
        }),
    }
}

/// Fetch and unpack the blob a record points at.
pub(crate) async fn fetch_group(
    record: &ParamMetadata,
    ctx: &UpdateContext,
) -> Result<BTreeMap<String, Tensor>> {
    let blob = ctx.store.smudge(&record.lfs_metadata.to_pointer()).await?;
    ctx.serializer.deserialize(&blob)
}

/// Pack and upload a tensor group, returning the pointer metadata.
pub(crate) async fn store_group(
    group: &BTreeMap<String, Tensor>,
    ctx: &UpdateContext,
) -> Result<LfsMetadata> {
    let blob = ctx.serializer.serialize(group)?;
    Ok(LfsMetadata::from_pointer(&ctx.store.clean(&blob).await?))
}

/// Recover the value a (previous) record describes by delegating to its own
/// plug-in.
pub(crate) async fn load_prior_value(
    prev: &ParamMetadata,
    name: &ParamName,
    ctx: &UpdateContext,
) -> Result<Tensor> {
    let handler = get_update_handler(&prev.theta_metadata.update_type, None)?;
    handler.apply(prev, name, ctx).await
}

/// Walk a `last_commit` pointer to the parameter's previous value.
pub(crate) async fn load_value_at_commit(
    last_commit: &str,
    name: &ParamName,
    ctx: &UpdateContext,
) -> Result<Tensor> {
    if last_commit.is_empty() {
        return Err(ThetaError::MissingPreviousValue {
            param: name.to_string(),
        });
    }
    let doc = Metadata::from_commit(&*ctx.repo, &ctx.path, last_commit).await?;
    let record = doc
        .get(name)
        .cloned()
        .ok_or_else(|| ThetaError::MissingPreviousValue {
            param: name.to_string(),
        })?;
    load_prior_value(&record, name, ctx).await
}

/// The previous value for a `write`: the passed-in previous record, or
/// `MissingPreviousValue` on a first-ever commit.
pub(crate) async fn require_prior_value(
    prev: Option<&ParamMetadata>,
    name: &ParamName,
    ctx: &UpdateContext,
) -> Result<Tensor> {
    let prev = prev.ok_or_else(|| ThetaError::MissingPreviousValue {
        param: name.to_string(),
    })?;
    load_prior_value(prev, name, ctx).await
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared scaffolding for plug-in tests: an in-memory repository and
    //! object store wired into an [`UpdateContext`].

    use super::*;
    use crate::git::MemoryRepository;
    use crate::lfs::MemoryObjectStore;
    use crate::metadata::{param_metadata, ParamMetadata, TensorMetadata};

    pub fn context() -> (UpdateContext, Arc<MemoryRepository>, Arc<MemoryObjectStore>) {
        let repo = Arc::new(MemoryRepository::new());
        let store = Arc::new(MemoryObjectStore::new());
        let config = RepoConfig::default();
        let lsh = Arc::new(EuclideanLsh::new(
            config.lsh_signature_size,
            config.parameter_atol,
            config.lsh_pool_size,
        ));
        let ctx = UpdateContext {
            repo: repo.clone() as Arc<dyn Repository>,
            store: store.clone() as Arc<dyn ObjectStore>,
            serializer: UpdateSerializer::new(),
            lsh,
            config,
            path: "model.ckpt".to_string(),
        };
        (ctx, repo, store)
    }

    /// Store `value` as a dense record and commit a metadata document
    /// holding it, so incremental plug-ins can walk back to it.
    pub async fn commit_dense(
        ctx: &UpdateContext,
        repo: &MemoryRepository,
        commit_id: &str,
        name: &ParamName,
        value: &Tensor,
    ) -> ParamMetadata {
        let handler = get_update_handler(dense::NAME, None).unwrap();
        let (lfs, _) = handler.write(value, name, None, ctx).await.unwrap();
        let record = param_metadata(
            TensorMetadata::from_tensor(value, &ctx.lsh),
            lfs,
            dense::NAME,
            "",
        );
        let mut doc = Metadata::new();
        doc.insert(name.clone(), record.clone());
        repo.commit_snapshot(
            commit_id,
            vec![(
                ctx.path.clone(),
                doc.serialize().unwrap().into_bytes(),
            )],
        );
        record
    }
}
