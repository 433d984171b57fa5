//! The commit ledger: per-commit sets of object-store OIDs.
//!
//! After each commit the post-commit hook records which OIDs the commit
//! introduced; before a push the pre-push hook unions the OID sets across
//! the outgoing commit range and uploads them. Storage is one small JSON
//! file per commit, named by commit hash, under `<git_dir>/theta/commits/`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ThetaError};
use crate::git::Repository;

fn oid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{64}$").expect("static regex"))
}

fn commit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{40}$").expect("static regex"))
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitRecord {
    oids: BTreeSet<String>,
}

/// One ledger directory, rooted in the repository's private data root.
#[derive(Debug, Clone)]
pub struct CommitLedger {
    dir: PathBuf,
}

impl CommitLedger {
    /// The ledger for a repository's git directory.
    pub fn new(git_dir: &Path) -> Self {
        Self {
            dir: git_dir.join("theta").join("commits"),
        }
    }

    fn commit_path(&self, commit: &str) -> PathBuf {
        self.dir.join(commit)
    }

    /// Record the OIDs a commit introduced. Both the commit hash and every
    /// OID are validated; rewriting an existing entry is rejected.
    pub fn write(&self, commit: &str, oids: &BTreeSet<String>) -> Result<()> {
        if !commit_regex().is_match(commit) {
            return Err(ThetaError::integrity(format!(
                "malformed commit hash {commit:?}"
            )));
        }
        for oid in oids {
            if !oid_regex().is_match(oid) {
                return Err(ThetaError::integrity(format!("malformed OID {oid:?}")));
            }
        }
        let path = self.commit_path(commit);
        if path.exists() {
            return Err(ThetaError::integrity(format!(
                "ledger entry for commit {commit} already exists"
            )));
        }
        std::fs::create_dir_all(&self.dir)?;
        let record = CommitRecord { oids: oids.clone() };
        std::fs::write(&path, serde_json::to_string(&record)?)?;
        tracing::debug!(commit, count = oids.len(), "wrote ledger entry");
        Ok(())
    }

    /// The OIDs a single commit introduced. A commit with no ledger entry
    /// introduced none (it predates tracking or touched no tracked path).
    pub fn read(&self, commit: &str) -> Result<BTreeSet<String>> {
        let path = self.commit_path(commit);
        if !path.is_file() {
            return Ok(BTreeSet::new());
        }
        let contents = std::fs::read_to_string(&path)?;
        let record: CommitRecord = serde_json::from_str(&contents).map_err(|e| {
            ThetaError::metadata_decode(
                Some(&path.to_string_lossy()),
                None,
                format!("malformed ledger entry: {e}"),
            )
        })?;
        Ok(record.oids)
    }

    /// Union of OIDs across the commit range `(old, new]`. An all-zero
    /// `old` walks from the root.
    pub async fn oids_in_range(
        &self,
        repo: &dyn Repository,
        old: &str,
        new: &str,
    ) -> Result<BTreeSet<String>> {
        let mut union = BTreeSet::new();
        for commit in repo.commits_in_range(old, new).await? {
            union.extend(self.read(&commit)?);
        }
        Ok(union)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MemoryRepository;

    fn oid(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn sha(c: char) -> String {
        c.to_string().repeat(40)
    }

    fn ledger() -> (CommitLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (CommitLedger::new(dir.path()), dir)
    }

    #[test]
    fn write_read_round_trip() {
        let (ledger, _guard) = ledger();
        let oids: BTreeSet<String> = [oid('a'), oid('b')].into();
        ledger.write(&sha('1'), &oids).unwrap();
        assert_eq!(ledger.read(&sha('1')).unwrap(), oids);
    }

    #[test]
    fn missing_entry_reads_empty() {
        let (ledger, _guard) = ledger();
        assert!(ledger.read(&sha('2')).unwrap().is_empty());
    }

    #[test]
    fn malformed_ids_rejected() {
        let (ledger, _guard) = ledger();
        assert!(matches!(
            ledger.write("HEAD", &BTreeSet::new()),
            Err(ThetaError::Integrity(_))
        ));
        let bad: BTreeSet<String> = ["not-an-oid".to_string()].into();
        assert!(matches!(
            ledger.write(&sha('3'), &bad),
            Err(ThetaError::Integrity(_))
        ));
        // Uppercase hex is not canonical.
        let upper: BTreeSet<String> = ["A".repeat(64)].into();
        assert!(ledger.write(&sha('3'), &upper).is_err());
    }

    #[test]
    fn duplicate_commit_rejected() {
        let (ledger, _guard) = ledger();
        ledger.write(&sha('4'), &BTreeSet::new()).unwrap();
        assert!(matches!(
            ledger.write(&sha('4'), &BTreeSet::new()),
            Err(ThetaError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn range_union_from_root_and_between() {
        let (ledger, _guard) = ledger();
        let repo = MemoryRepository::new();
        for c in ['1', '2', '3'] {
            repo.commit_snapshot(&sha(c), vec![]);
        }
        ledger.write(&sha('1'), &[oid('a')].into()).unwrap();
        // Commit 2 has no entry.
        ledger.write(&sha('3'), &[oid('b'), oid('c')].into()).unwrap();

        let from_root = ledger
            .oids_in_range(&repo, &"0".repeat(40), &sha('3'))
            .await
            .unwrap();
        assert_eq!(from_root, [oid('a'), oid('b'), oid('c')].into());

        let tail = ledger
            .oids_in_range(&repo, &sha('1'), &sha('3'))
            .await
            .unwrap();
        assert_eq!(tail, [oid('b'), oid('c')].into());
    }
}
