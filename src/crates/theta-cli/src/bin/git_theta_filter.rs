//! The clean/smudge filter binary git invokes on tracked paths.
//!
//! `clean <path>` reads a checkpoint on stdin and writes its metadata
//! document to stdout; `smudge <path>` reads a metadata document and writes
//! the reconstructed checkpoint. Errors exit non-zero with a diagnostic on
//! stderr, which makes the host git command fail.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use theta_core::checkpoints::{get_checkpoint_handler, get_checkpoint_handler_name};
use theta_core::filters::{clean, smudge, FilterOptions};
use theta_core::metadata::Metadata;
use theta_cli::{init_tracing, runtime_for};

#[derive(Parser)]
#[command(name = "git-theta-filter")]
#[command(about = "git-theta clean/smudge filter", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a checkpoint on stdin into a metadata document on stdout
    Clean {
        /// Repo-relative path of the file being filtered
        path: PathBuf,
    },
    /// Convert a metadata document on stdin back into a checkpoint on stdout
    Smudge {
        /// Repo-relative path of the file being filtered
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Clean { path } => run_clean(path).await,
        Commands::Smudge { path } => run_smudge(path).await,
    }
}

async fn run_clean(path: PathBuf) -> Result<()> {
    let runtime = runtime_for(&path).await?;
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .context("reading checkpoint from stdin")?;

    let format = get_checkpoint_handler_name(None, &runtime.config, &runtime.ctx.path);
    tracing::debug!(path = %runtime.ctx.path, format = %format, "cleaning checkpoint");
    let handler = get_checkpoint_handler(&format)?;
    let checkpoint = handler.load(&mut input.as_slice())?;

    let options = FilterOptions::from_env(&runtime.ctx)?;
    let metadata = clean(checkpoint, &runtime.ctx, &options).await?;
    let rendered = metadata.serialize()?;
    std::io::stdout()
        .write_all(rendered.as_bytes())
        .context("writing metadata to stdout")?;
    Ok(())
}

async fn run_smudge(path: PathBuf) -> Result<()> {
    let runtime = runtime_for(&path).await?;
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .context("reading metadata from stdin")?;

    let metadata = Metadata::parse(&input, Some(&runtime.ctx.path))?;
    tracing::debug!(path = %runtime.ctx.path, params = metadata.len(), "smudging checkpoint");
    let checkpoint = smudge(metadata, &runtime.ctx).await?;

    let format = get_checkpoint_handler_name(None, &runtime.config, &runtime.ctx.path);
    let handler = get_checkpoint_handler(&format)?;
    let mut stdout = std::io::stdout();
    handler.save(&checkpoint, &mut stdout)?;
    stdout.flush().context("flushing checkpoint to stdout")?;
    Ok(())
}
