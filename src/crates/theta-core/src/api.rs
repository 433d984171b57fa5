//! Programmatic entry points.
//!
//! These mirror the filter pipeline without touching the working tree: a
//! checkpoint is cleaned and committed straight into the object database,
//! or smudged out of an arbitrary historical ref.

use crate::checkpoints::Checkpoint;
use crate::error::{Result, ThetaError};
use crate::filters::{clean, smudge, FilterOptions};
use crate::git::GitRepository;
use crate::metadata::Metadata;
use crate::updates::UpdateContext;

/// Clean a checkpoint and commit the resulting metadata document at `path`,
/// without writing the checkpoint to the working tree. Returns the new
/// commit id.
pub async fn save_to_git(
    checkpoint: Checkpoint,
    repo: &GitRepository,
    ctx: &UpdateContext,
    message: &str,
    options: &FilterOptions,
) -> Result<String> {
    let metadata = clean(checkpoint, ctx, options).await?;
    let rendered = metadata.serialize()?;
    let blob = repo.make_blob(rendered.as_bytes(), &ctx.path).await?;
    repo.stage(&blob).await?;
    repo.commit(message).await
}

/// Load the checkpoint stored at `path` as of `reference`, without checking
/// the commit out.
pub async fn load_from_git(
    reference: &str,
    ctx: &UpdateContext,
) -> Result<Checkpoint> {
    let bytes = ctx
        .repo
        .file_at_commit(&ctx.path, reference)
        .await?
        .ok_or_else(|| ThetaError::metadata_decode(
            Some(&ctx.path),
            None,
            format!("no metadata at {reference}"),
        ))?;
    let metadata = Metadata::parse(&bytes, Some(&ctx.path))?;
    smudge(metadata, ctx).await
}
