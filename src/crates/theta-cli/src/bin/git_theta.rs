//! The git-theta porcelain: install, track, add, and the commit/push hooks.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use theta_core::git::{parse_pre_push_input, GitAttributes, GitRepository, Repository};
use theta_core::ledger::CommitLedger;
use theta_core::lfs::{GitLfsStore, ObjectStore};
use theta_core::metadata::Metadata;
use theta_core::utils::env;
use theta_core::ThetaConfig;
use theta_cli::init_tracing;

#[derive(Parser)]
#[command(name = "git-theta")]
#[command(about = "Version control for machine learning model checkpoints", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wire the theta filter, merge, and diff drivers into git config
    Install,

    /// Track a checkpoint path or pattern with git-theta
    Track {
        /// Checkpoint file or glob pattern to track
        pattern: String,

        /// Checkpoint format for files matching the pattern
        #[arg(long = "checkpoint-format")]
        checkpoint_format: Option<String>,
    },

    /// Stage checkpoints, optionally with a non-dense update type
    Add {
        /// Paths to stage
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Update plug-in to use for changed parameters
        #[arg(long = "update-type")]
        update_type: Option<String>,

        /// Side-loaded update data file
        #[arg(long = "update-data")]
        update_data: Option<PathBuf>,
    },

    /// Record the object IDs introduced by the commit that just finished
    PostCommit,

    /// Send outgoing objects to the object store before a push
    PrePush {
        /// Name of the remote being pushed to
        remote_name: String,

        /// Location of the remote being pushed to
        remote_location: String,
    },

    /// Summarize parameter-level changes between two metadata documents
    /// (invoked by git as the diff driver)
    #[command(hide = true)]
    Diff {
        /// Arguments as git passes them: path old-file old-hex old-mode
        /// new-file new-hex new-mode
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Install => install().await,
        Commands::Track {
            pattern,
            checkpoint_format,
        } => track(&pattern, checkpoint_format.as_deref()).await,
        Commands::Add {
            paths,
            update_type,
            update_data,
        } => add(&paths, update_type.as_deref(), update_data.as_deref()).await,
        Commands::PostCommit => post_commit().await,
        Commands::PrePush { remote_name, .. } => pre_push(&remote_name).await,
        Commands::Diff { args } => diff(&args).await,
    }
}

async fn run_git(args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("spawning git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Write the driver wiring into the user's global git config. Re-running
/// overwrites the same keys, so installation is idempotent.
async fn install() -> Result<()> {
    let entries = [
        ("filter.theta.clean", "git-theta-filter clean %f"),
        ("filter.theta.smudge", "git-theta-filter smudge %f"),
        ("filter.theta.required", "true"),
        ("merge.theta.name", "git-theta merge driver"),
        ("merge.theta.driver", "git-theta-merge %O %A %B %P"),
        ("diff.theta.command", "git-theta diff"),
    ];
    for (key, value) in entries {
        run_git(&["config", "--global", key, value]).await?;
    }
    println!("git-theta drivers installed");
    Ok(())
}

/// Write the post-commit and pre-push hook scripts.
fn ensure_hooks(repo: &GitRepository) -> Result<()> {
    let hooks = repo.git_dir().join("hooks");
    std::fs::create_dir_all(&hooks)?;
    for (name, command) in [
        ("post-commit", "#!/bin/sh\nexec git-theta post-commit \"$@\"\n"),
        ("pre-push", "#!/bin/sh\nexec git-theta pre-push \"$@\"\n"),
    ] {
        let path = hooks.join(name);
        std::fs::write(&path, command)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(&path)?.permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            std::fs::set_permissions(&path, permissions)?;
        }
    }
    Ok(())
}

async fn track(pattern: &str, checkpoint_format: Option<&str>) -> Result<()> {
    let repo = GitRepository::discover(std::path::Path::new(".")).await?;
    ensure_hooks(&repo)?;
    let relative = repo.relative_path(std::path::Path::new(pattern))?;

    let attributes_path = repo.root().join(".gitattributes");
    let mut attributes = GitAttributes::read(&attributes_path)?;
    attributes.add_theta(&relative)?;
    attributes.write(&attributes_path)?;
    repo.add(".gitattributes").await?;

    if let Some(format) = checkpoint_format {
        let mut config = ThetaConfig::load(repo.root())?;
        config.set_pattern(&relative, format);
        config.write(repo.root())?;
        repo.add(theta_core::config::CONFIG_FILE_NAME).await?;
    }
    tracing::info!(pattern = %relative, "tracking with git-theta");
    Ok(())
}

/// Stage checkpoints, exposing the update options to the filter subprocess
/// through the environment. `--renormalize` forces the clean filter to
/// re-run even when the file's stat data is unchanged, which is exactly the
/// case when only side-loaded update data changed.
async fn add(
    paths: &[PathBuf],
    update_type: Option<&str>,
    update_data: Option<&std::path::Path>,
) -> Result<()> {
    let mut command = tokio::process::Command::new("git");
    command.arg("add");
    if update_type.is_some() || update_data.is_some() {
        command.arg("--renormalize");
    }
    command.arg("--");
    command.args(paths);
    if let Some(update_type) = update_type {
        command.env(env::UPDATE_TYPE, update_type);
    }
    if let Some(update_data) = update_data {
        command.env(env::UPDATE_DATA_PATH, update_data);
    }
    let status = command.status().await.context("spawning git add")?;
    if !status.success() {
        bail!("git add exited with {status}");
    }
    Ok(())
}

/// Union the OIDs of added and modified parameters across every tracked
/// path the commit touched, and record them in the ledger.
async fn post_commit() -> Result<()> {
    let repo = GitRepository::discover(std::path::Path::new(".")).await?;
    let Some(head) = repo.head_sha().await? else {
        bail!("post-commit hook ran without a HEAD commit");
    };

    let attributes = GitAttributes::read(&repo.root().join(".gitattributes"))?;
    let mut oids = BTreeSet::new();
    for path in repo.changed_paths("HEAD").await? {
        if !attributes.is_theta_tracked(&path) {
            continue;
        }
        let current = Metadata::from_commit(&repo, &path, "HEAD").await?;
        let previous = Metadata::from_commit(&repo, &path, "HEAD~1").await?;
        let (added, _removed, modified) = current.diff(&previous);
        oids.extend(added.oids());
        oids.extend(modified.oids());
    }

    let ledger = CommitLedger::new(repo.git_dir());
    ledger.write(&head, &oids)?;
    tracing::info!(commit = %head, count = oids.len(), "recorded commit OIDs");
    Ok(())
}

/// Collect OIDs across every outgoing commit range and hand them to the
/// object store's push.
async fn pre_push(remote_name: &str) -> Result<()> {
    let repo = GitRepository::discover(std::path::Path::new(".")).await?;
    let ledger = CommitLedger::new(repo.git_dir());

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading pre-push ranges from stdin")?;

    let mut oids = BTreeSet::new();
    for range in parse_pre_push_input(&input)? {
        oids.extend(
            ledger
                .oids_in_range(&repo, &range.remote_sha, &range.local_sha)
                .await?,
        );
    }
    tracing::info!(remote = remote_name, count = oids.len(), "pushing objects");
    let store = GitLfsStore::new(repo.root());
    store.push(remote_name, &oids).await?;
    Ok(())
}

/// The diff driver: print which parameters were added, removed, or
/// modified between the two metadata documents git hands us.
async fn diff(args: &[String]) -> Result<()> {
    // git invokes the driver as: path old-file old-hex old-mode new-file ...
    let [path, old_file, _, _, new_file, ..] = args else {
        bail!("unexpected diff driver arguments: {args:?}");
    };
    let read_doc = |file: &str| -> Result<Metadata> {
        if file == "/dev/null" {
            return Ok(Metadata::new());
        }
        let bytes = std::fs::read(file).with_context(|| format!("reading {file}"))?;
        Ok(Metadata::parse(&bytes, Some(path))?)
    };
    let old = read_doc(old_file)?;
    let new = read_doc(new_file)?;
    let (added, removed, modified) = new.diff(&old);

    println!("git-theta diff for {path}");
    for (label, doc) in [("added", &added), ("removed", &removed), ("modified", &modified)] {
        for (name, _) in doc.iter() {
            println!("  {label}: {name}");
        }
    }
    Ok(())
}
