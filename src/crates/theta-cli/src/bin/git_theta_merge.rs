//! The merge driver git invokes on conflicting metadata documents.
//!
//! Arguments follow git's merge-driver convention: the ancestor file (%O),
//! ours (%A, which also receives the result), theirs (%B), and the real
//! path (%P). One-sided changes resolve automatically; true conflicts are
//! handed to the strategy named by `GIT_THETA_MANUAL_MERGE`, and fail the
//! merge when none is configured.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use theta_core::merges::{
    diff_state, get_merge_handler, DiffState, MergeArgs, MergeContext, MergeSides,
};
use theta_core::metadata::Metadata;
use theta_core::utils::{env, ParamName};
use theta_cli::{init_tracing, runtime_for};

#[derive(Parser)]
#[command(name = "git-theta-merge")]
#[command(about = "git-theta per-parameter merge driver", long_about = None)]
#[command(version)]
struct Cli {
    /// Ancestor metadata document (%O)
    ancestor: PathBuf,
    /// Our metadata document; receives the merge result (%A)
    ours: PathBuf,
    /// Their metadata document (%B)
    theirs: PathBuf,
    /// Repo-relative path of the file being merged (%P)
    path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let read_doc = |file: &PathBuf| -> Result<Metadata> {
        let bytes =
            std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        Ok(Metadata::parse(&bytes, Some(&file.to_string_lossy()))?)
    };
    let doc_o = read_doc(&cli.ancestor)?;
    let doc_a = read_doc(&cli.ours)?;
    let doc_b = read_doc(&cli.theirs)?;

    let runtime = runtime_for(&cli.path).await?;
    let head = runtime
        .ctx
        .repo
        .head_sha()
        .await?
        .unwrap_or_default();
    let mctx = MergeContext::new(runtime.ctx.clone(), head);

    let manual = env::var(env::MANUAL_MERGE)
        .map(|name| get_merge_handler(&name))
        .transpose()?;

    let mut names: BTreeSet<ParamName> = BTreeSet::new();
    names.extend(doc_a.keys().cloned());
    names.extend(doc_b.keys().cloned());
    names.extend(doc_o.keys().cloned());

    let mut merged = Metadata::new();
    for name in names {
        let sides = MergeSides {
            a: doc_a.get(&name),
            b: doc_b.get(&name),
            o: doc_o.get(&name),
            doc_a: &doc_a,
            doc_b: &doc_b,
            doc_o: &doc_o,
        };
        let state = diff_state(sides.a, sides.b, sides.o);
        let same_as_ancestor = |side: Option<&theta_core::ParamMetadata>| {
            matches!(
                (side, sides.o),
                (Some(s), Some(o)) if s.lfs_metadata.oid == o.lfs_metadata.oid
            )
        };
        // One-sided changes resolve automatically; a delete on one side
        // propagates only when the other side left the parameter alone.
        let resolved = match state {
            DiffState::Equal | DiffState::ChangedA | DiffState::AddedA => Some(sides.a.cloned()),
            DiffState::ChangedB | DiffState::AddedB => Some(sides.b.cloned()),
            DiffState::DeletedBoth => Some(None),
            DiffState::DeletedA if same_as_ancestor(sides.b) => Some(None),
            DiffState::DeletedB if same_as_ancestor(sides.a) => Some(None),
            DiffState::ChangedBoth
            | DiffState::AddedBoth
            | DiffState::DeletedA
            | DiffState::DeletedB => None,
        };
        let resolved = match resolved {
            Some(resolution) => resolution,
            None => {
                let Some(strategy) = &manual else {
                    bail!(
                        "conflicting changes to parameter '{name}' in {}; set {} to a merge \
                         strategy to resolve",
                        cli.path.display(),
                        env::MANUAL_MERGE
                    );
                };
                if !strategy.active_for(state) {
                    bail!(
                        "merge strategy '{}' is inactive for the conflict on '{name}'",
                        strategy.name()
                    );
                }
                tracing::info!(param = %name, strategy = strategy.name(), "resolving conflict");
                let outcome = strategy
                    .merge(&name, &sides, &mctx, &MergeArgs::new())
                    .await?;
                match outcome {
                    Some(record) => Some(record),
                    None => bail!(
                        "merge strategy '{}' produced no result for '{name}'",
                        strategy.name()
                    ),
                }
            }
        };
        if let Some(record) = resolved {
            merged.insert(name, record);
        }
    }

    std::fs::write(&cli.ours, merged.serialize()?)
        .with_context(|| format!("writing merge result to {}", cli.ours.display()))?;
    Ok(())
}
