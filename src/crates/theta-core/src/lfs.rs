//! Large-object store integration.
//!
//! Tensor blobs never live in git history; they go to a content-addressed
//! store that hands back a three-line pointer document. The store is a
//! subprocess in production (`git lfs clean` / `git lfs smudge` /
//! `git lfs push`) exchanging bytes over stdin/stdout; each call is one
//! request/response, so concurrent callers need no shared state beyond the
//! repository they target. [`MemoryObjectStore`] is the in-process backend
//! the test suite runs against.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Result, ThetaError};

/// Protocol marker written into fresh pointers.
pub const LFS_VERSION: &str = "https://git-lfs.github.com/spec/v1";

/// A parsed pointer document: `(version, oid, size)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfsPointer {
    pub version: String,
    pub oid: String,
    pub size: String,
}

impl LfsPointer {
    /// Parse the strict pointer grammar:
    /// `^version <v>\noid sha256:<64-hex>\nsize <digits>\n$`.
    pub fn parse(contents: &str) -> Result<Self> {
        let re = Regex::new(
            r"^version (?P<version>\S+)\noid sha256:(?P<oid>[0-9a-f]{64})\nsize (?P<size>[0-9]+)\n$",
        )
        .expect("static regex");
        let caps = re
            .captures(contents)
            .ok_or_else(|| ThetaError::PointerParse(contents.to_string()))?;
        Ok(Self {
            version: caps["version"].to_string(),
            oid: caps["oid"].to_string(),
            size: caps["size"].to_string(),
        })
    }
}

impl fmt::Display for LfsPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {}\noid sha256:{}\nsize {}\n",
            self.version, self.oid, self.size
        )
    }
}

/// The external content-addressed object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a blob, returning its pointer.
    async fn clean(&self, blob: &[u8]) -> Result<LfsPointer>;

    /// Fetch the blob a pointer names. `ObjectNotFound` is fatal during
    /// smudge.
    async fn smudge(&self, pointer: &LfsPointer) -> Result<Vec<u8>>;

    /// Upload the named objects to a remote.
    async fn push(&self, remote: &str, oids: &BTreeSet<String>) -> Result<()>;
}

/// The production store: pipes through the `git lfs` subprocess.
#[derive(Debug, Clone)]
pub struct GitLfsStore {
    root: PathBuf,
}

impl GitLfsStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            root: repo_root.to_path_buf(),
        }
    }

    async fn exchange(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ThetaError::ObjectStoreUnavailable(format!("git {}: {e}", args[0])))?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(input).await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ThetaError::ObjectStoreUnavailable(format!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ObjectStore for GitLfsStore {
    async fn clean(&self, blob: &[u8]) -> Result<LfsPointer> {
        let stdout = self.exchange(&["lfs", "clean"], blob).await?;
        LfsPointer::parse(&String::from_utf8_lossy(&stdout))
    }

    async fn smudge(&self, pointer: &LfsPointer) -> Result<Vec<u8>> {
        self.exchange(&["lfs", "smudge"], pointer.to_string().as_bytes())
            .await
    }

    async fn push(&self, remote: &str, oids: &BTreeSet<String>) -> Result<()> {
        if oids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["lfs", "push", "--object-id", remote];
        args.extend(oids.iter().map(String::as_str));
        self.exchange(&args, &[]).await?;
        Ok(())
    }
}

/// In-memory content-addressed store. Test backend.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct objects held.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, oid: &str) -> bool {
        self.objects.read().unwrap().contains_key(oid)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn clean(&self, blob: &[u8]) -> Result<LfsPointer> {
        let oid = sha256_hex(blob);
        self.objects
            .write()
            .unwrap()
            .insert(oid.clone(), blob.to_vec());
        Ok(LfsPointer {
            version: LFS_VERSION.to_string(),
            oid,
            size: blob.len().to_string(),
        })
    }

    async fn smudge(&self, pointer: &LfsPointer) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap()
            .get(&pointer.oid)
            .cloned()
            .ok_or_else(|| ThetaError::ObjectNotFound {
                oid: pointer.oid.clone(),
            })
    }

    async fn push(&self, _remote: &str, oids: &BTreeSet<String>) -> Result<()> {
        let objects = self.objects.read().unwrap();
        for oid in oids {
            if !objects.contains_key(oid) {
                return Err(ThetaError::ObjectNotFound { oid: oid.clone() });
            }
        }
        Ok(())
    }
}
