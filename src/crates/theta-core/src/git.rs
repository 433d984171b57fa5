//! Git plumbing.
//!
//! Everything the pipeline needs from the host VCS goes through the `git`
//! binary: reading a path's bytes as of a ref, resolving `HEAD`, walking
//! commit ranges, writing blobs straight into the object database, and
//! staging without touching the working tree. Reads are behind the
//! [`Repository`] trait so the filter driver can run against
//! [`MemoryRepository`] in tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Result, ThetaError};

/// Read-only repository access used from per-parameter tasks.
///
/// Writes (staging, committing) stay on the concrete [`GitRepository`]; tasks
/// only ever read, which is what makes the concurrent driver safe.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Repository root (the working tree top level).
    fn root(&self) -> &Path;

    /// A path's content as of a ref, or `None` when the ref or path does not
    /// exist (e.g. before the first commit).
    async fn file_at_commit(&self, path: &str, reference: &str) -> Result<Option<Vec<u8>>>;

    /// The commit id of `HEAD`, or `None` in an unborn repository.
    async fn head_sha(&self) -> Result<Option<String>>;

    /// Commit ids in `(old, new]`, newest first. An all-zero `old` means
    /// "from the root".
    async fn commits_in_range(&self, old: &str, new: &str) -> Result<Vec<String>>;
}

fn is_all_zeros(reference: &str) -> bool {
    !reference.is_empty() && reference.bytes().all(|b| b == b'0')
}

/// Run a git command, feeding `stdin` if given, returning stdout on success.
async fn run_git(cwd: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|e| ThetaError::Git {
        command: args.join(" "),
        message: format!("failed to spawn git: {e}"),
    })?;
    if let Some(bytes) = stdin {
        let mut handle = child.stdin.take().expect("stdin was piped");
        handle.write_all(bytes).await?;
        drop(handle);
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(ThetaError::Git {
            command: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// A blob written into the object database together with the path it will be
/// staged at.
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub oid: String,
    pub path: String,
}

/// The real repository, driven through git plumbing commands.
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
    git_dir: PathBuf,
}

impl GitRepository {
    /// Discover the repository containing `start`.
    pub async fn discover(start: &Path) -> Result<Self> {
        let top = run_git(start, &["rev-parse", "--show-toplevel"], None).await?;
        let root = PathBuf::from(String::from_utf8_lossy(&top).trim());
        let git_dir_raw = run_git(&root, &["rev-parse", "--git-dir"], None).await?;
        let mut git_dir = PathBuf::from(String::from_utf8_lossy(&git_dir_raw).trim());
        if git_dir.is_relative() {
            git_dir = root.join(git_dir);
        }
        Ok(Self { root, git_dir })
    }

    /// The repository's `.git` directory (private data root).
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// A path made relative to the repository root.
    pub fn relative_path(&self, path: &Path) -> Result<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let relative = absolute.strip_prefix(&self.root).map_err(|_| {
            ThetaError::config(format!(
                "{} is outside the repository at {}",
                path.display(),
                self.root.display()
            ))
        })?;
        Ok(relative.to_string_lossy().replace('\\', "/"))
    }

    /// A repo-relative path made absolute.
    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write `contents` into the object database and pair the blob with a
    /// path, without touching the working tree.
    pub async fn make_blob(&self, contents: &[u8], path: &str) -> Result<StagedBlob> {
        let stdout = run_git(&self.root, &["hash-object", "-w", "--stdin"], Some(contents)).await?;
        Ok(StagedBlob {
            oid: String::from_utf8_lossy(&stdout).trim().to_string(),
            path: path.to_string(),
        })
    }

    /// Put a blob into the index.
    pub async fn stage(&self, blob: &StagedBlob) -> Result<()> {
        let spec = format!("100644,{},{}", blob.oid, blob.path);
        run_git(
            &self.root,
            &["update-index", "--add", "--cacheinfo", &spec],
            None,
        )
        .await?;
        Ok(())
    }

    /// `git add` a working-tree path.
    pub async fn add(&self, path: &str) -> Result<()> {
        run_git(&self.root, &["add", "--", path], None).await?;
        Ok(())
    }

    /// Commit the index and return the new commit id.
    pub async fn commit(&self, message: &str) -> Result<String> {
        run_git(&self.root, &["commit", "-m", message], None).await?;
        let head = self.head_sha().await?;
        head.ok_or_else(|| ThetaError::Git {
            command: "commit".to_string(),
            message: "HEAD missing after commit".to_string(),
        })
    }

    /// Paths changed by a commit.
    pub async fn changed_paths(&self, reference: &str) -> Result<Vec<String>> {
        let stdout = run_git(
            &self.root,
            &[
                "diff-tree",
                "--no-commit-id",
                "--name-only",
                "-r",
                "--root",
                reference,
            ],
            None,
        )
        .await?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn file_at_commit(&self, path: &str, reference: &str) -> Result<Option<Vec<u8>>> {
        let spec = format!("{reference}:{path}");
        match run_git(&self.root, &["cat-file", "blob", &spec], None).await {
            Ok(bytes) => Ok(Some(bytes)),
            // A bad ref, unborn HEAD, or absent path all read as "no prior
            // version"; genuine git failures surface on the next write.
            Err(_) => Ok(None),
        }
    }

    async fn head_sha(&self) -> Result<Option<String>> {
        match run_git(&self.root, &["rev-parse", "--verify", "HEAD"], None).await {
            Ok(stdout) => Ok(Some(String::from_utf8_lossy(&stdout).trim().to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn commits_in_range(&self, old: &str, new: &str) -> Result<Vec<String>> {
        let range;
        let args: Vec<&str> = if is_all_zeros(old) || old.is_empty() {
            vec!["rev-list", new]
        } else {
            range = format!("{old}..{new}");
            vec!["rev-list", &range]
        };
        let stdout = run_git(&self.root, &args, None).await?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// In-memory repository: a linear history of full snapshots. Test backend.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    root: PathBuf,
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    commits: Vec<String>,
    files: HashMap<String, HashMap<String, Vec<u8>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a commit holding a full snapshot of tracked files.
    pub fn commit_snapshot(&self, commit_id: &str, files: Vec<(String, Vec<u8>)>) {
        let mut state = self.state.write().unwrap();
        state.commits.push(commit_id.to_string());
        state
            .files
            .insert(commit_id.to_string(), files.into_iter().collect());
    }

    fn resolve(&self, reference: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        if reference == "HEAD" {
            state.commits.last().cloned()
        } else if state.commits.iter().any(|c| c == reference) {
            Some(reference.to_string())
        } else {
            None
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn file_at_commit(&self, path: &str, reference: &str) -> Result<Option<Vec<u8>>> {
        let Some(commit) = self.resolve(reference) else {
            return Ok(None);
        };
        let state = self.state.read().unwrap();
        Ok(state
            .files
            .get(&commit)
            .and_then(|snapshot| snapshot.get(path))
            .cloned())
    }

    async fn head_sha(&self) -> Result<Option<String>> {
        Ok(self.state.read().unwrap().commits.last().cloned())
    }

    async fn commits_in_range(&self, old: &str, new: &str) -> Result<Vec<String>> {
        let state = self.state.read().unwrap();
        let end = if new == "HEAD" {
            state.commits.len()
        } else {
            match state.commits.iter().position(|c| c == new) {
                Some(idx) => idx + 1,
                None => {
                    return Err(ThetaError::Git {
                        command: "rev-list".to_string(),
                        message: format!("unknown commit {new}"),
                    })
                }
            }
        };
        let start = if is_all_zeros(old) || old.is_empty() {
            0
        } else {
            match state.commits.iter().position(|c| c == old) {
                Some(idx) => idx + 1,
                None => 0,
            }
        };
        Ok(state.commits[start..end].iter().rev().cloned().collect())
    }
}

/// One line of a `.gitattributes` file: a pattern plus its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeLine {
    pub pattern: String,
    pub attributes: Vec<String>,
}

impl AttributeLine {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let pattern = parts
            .next()
            .ok_or_else(|| ThetaError::config(format!("invalid attribute line: {line:?}")))?
            .to_string();
        Ok(Self {
            pattern,
            attributes: parts.map(str::to_string).collect(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = self.pattern.clone();
        for attr in &self.attributes {
            out.push(' ');
            out.push_str(attr);
        }
        out
    }

    fn attribute_value(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find_map(|a| a.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
    }
}

/// The repository's `.gitattributes`, edited in place while preserving
/// unrelated lines and attributes.
#[derive(Debug, Default, Clone)]
pub struct GitAttributes {
    pub lines: Vec<AttributeLine>,
}

impl GitAttributes {
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let lines = contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(AttributeLine::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { lines })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut rendered = self
            .lines
            .iter()
            .map(AttributeLine::render)
            .collect::<Vec<_>>()
            .join("\n");
        rendered.push('\n');
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// Point `filter`, `merge`, and `diff` at theta for a pattern.
    ///
    /// Disjoint attributes already on a matching line are preserved; a
    /// conflicting non-theta driver is a configuration error.
    pub fn add_theta(&mut self, pattern: &str) -> Result<()> {
        for line in &mut self.lines {
            if line.pattern == pattern {
                for key in ["filter", "merge", "diff"] {
                    match line.attribute_value(key) {
                        Some("theta") => {}
                        Some(other) => {
                            return Err(ThetaError::config(format!(
                                "pattern {pattern:?} already sets {key}={other}"
                            )))
                        }
                        None => line.attributes.push(format!("{key}=theta")),
                    }
                }
                return Ok(());
            }
        }
        self.lines.push(AttributeLine {
            pattern: pattern.to_string(),
            attributes: vec![
                "filter=theta".to_string(),
                "merge=theta".to_string(),
                "diff=theta".to_string(),
            ],
        });
        Ok(())
    }

    /// Patterns whose filter is theta.
    pub fn theta_patterns(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.attribute_value("filter") == Some("theta"))
            .map(|l| l.pattern.as_str())
            .collect()
    }

    /// Whether a repo-relative path is tracked by theta.
    pub fn is_theta_tracked(&self, path: &str) -> bool {
        self.theta_patterns().iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(path))
                .unwrap_or(false)
        })
    }
}

/// One parsed line of pre-push stdin:
/// `<local_ref> <local_sha1> <remote_ref> <remote_sha1>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRange {
    pub local_ref: String,
    pub local_sha: String,
    pub remote_ref: String,
    pub remote_sha: String,
}

/// Parse the stdin the pre-push hook receives from git.
pub fn parse_pre_push_input(input: &str) -> Result<Vec<PushRange>> {
    let line_re = Regex::new(
        r"^(?P<local_ref>\S+) (?P<local_sha>[0-9a-f]{40}) (?P<remote_ref>\S+) (?P<remote_sha>[0-9a-f]{40})$",
    )
    .expect("static regex");
    input
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let caps = line_re.captures(line).ok_or_else(|| {
                ThetaError::config(format!("invalid pre-push line: {line:?}"))
            })?;
            Ok(PushRange {
                local_ref: caps["local_ref"].to_string(),
                local_sha: caps["local_sha"].to_string(),
                remote_ref: caps["remote_ref"].to_string(),
                remote_sha: caps["remote_sha"].to_string(),
            })
        })
        .collect()
}
