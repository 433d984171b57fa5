//! Shared runtime plumbing for the git-theta binaries.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use theta_core::git::{GitRepository, Repository};
use theta_core::lfs::{GitLfsStore, ObjectStore};
use theta_core::params::UpdateSerializer;
use theta_core::updates::UpdateContext;
use theta_core::utils::env;
use theta_core::{lsh_from_config, ThetaConfig};

/// Install the stderr logger, filtered by `GIT_THETA_LOG_LEVEL`.
///
/// Stdout belongs to the filter protocol; diagnostics must never land
/// there.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(env::LOG_LEVEL)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything a command needs: the repository, its configuration, and the
/// update context wired to the real object store.
pub struct Runtime {
    pub repo: GitRepository,
    pub config: ThetaConfig,
    pub ctx: UpdateContext,
}

/// Discover the repository around `path` and assemble the runtime for the
/// checkpoint at that (repo-relative) path.
pub async fn runtime_for(path: &Path) -> Result<Runtime> {
    let repo = GitRepository::discover(Path::new("."))
        .await
        .context("not inside a git repository")?;
    let config = ThetaConfig::load(repo.root()).context("failed to load .thetaconfig")?;
    let relative = repo
        .relative_path(path)
        .with_context(|| format!("resolving {}", path.display()))?;
    let ctx = UpdateContext {
        repo: Arc::new(repo.clone()) as Arc<dyn Repository>,
        store: Arc::new(GitLfsStore::new(repo.root())) as Arc<dyn ObjectStore>,
        serializer: UpdateSerializer::new(),
        lsh: lsh_from_config(&config.repo),
        config: config.repo.clone(),
        path: relative,
    };
    Ok(Runtime { repo, config, ctx })
}
