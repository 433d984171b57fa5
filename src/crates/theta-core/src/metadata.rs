//! The per-parameter metadata document.
//!
//! A checkpoint's surrogate in git history: a nested JSON mapping with the
//! checkpoint's key structure whose leaves are parameter records. The
//! canonical external form is pretty-printed JSON with 4-space indent and
//! lexicographically sorted keys at every level, so bytewise-identical
//! checkpoints clean to bytewise-identical documents.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use theta_lsh::{EuclideanLsh, Signature};
use theta_tensor::Tensor;

use crate::error::{Result, ThetaError};
use crate::git::Repository;
use crate::lfs::LfsPointer;
use crate::utils::{flatten, unflatten, ParamName};

/// Shape, dtype, and LSH signature of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMetadata {
    pub shape: Vec<usize>,
    pub dtype: String,
    pub hash: Vec<i64>,
}

impl TensorMetadata {
    /// Summarize a tensor, hashing it with the repository's LSH.
    pub fn from_tensor(tensor: &Tensor, lsh: &EuclideanLsh) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype().to_string(),
            hash: lsh.hash(&tensor.to_f64s()),
        }
    }
}

/// The object-store pointer fields for one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfsMetadata {
    pub version: String,
    pub oid: String,
    pub size: String,
}

impl LfsMetadata {
    pub fn from_pointer(pointer: &LfsPointer) -> Self {
        Self {
            version: pointer.version.clone(),
            oid: pointer.oid.clone(),
            size: pointer.size.clone(),
        }
    }

    pub fn to_pointer(&self) -> LfsPointer {
        LfsPointer {
            version: self.version.clone(),
            oid: self.oid.clone(),
            size: self.size.clone(),
        }
    }
}

/// How a parameter was last stored: the update plug-in and the commit at
/// which it was last touched (empty before the first commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThetaMetadata {
    pub update_type: String,
    pub last_commit: String,
}

/// The full record for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMetadata {
    pub tensor_metadata: TensorMetadata,
    pub lfs_metadata: LfsMetadata,
    pub theta_metadata: ThetaMetadata,
}

const LEAF_KEY: &str = "lfs_metadata";

/// A whole metadata document, held flat and keyed by [`ParamName`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    params: BTreeMap<ParamName, ParamMetadata>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: ParamName, record: ParamMetadata) {
        self.params.insert(name, record);
    }

    pub fn get(&self, name: &ParamName) -> Option<&ParamMetadata> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamName, &ParamMetadata)> {
        self.params.iter()
    }

    pub fn into_iter(self) -> impl Iterator<Item = (ParamName, ParamMetadata)> {
        self.params.into_iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamName> {
        self.params.keys()
    }

    /// All object-store OIDs named by this document.
    pub fn oids(&self) -> BTreeSet<String> {
        self.params
            .values()
            .map(|p| p.lfs_metadata.oid.clone())
            .collect()
    }

    /// Parse a document from its canonical JSON bytes.
    pub fn parse(bytes: &[u8], path: Option<&str>) -> Result<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new());
        }
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            ThetaError::metadata_decode(path, None, format!("invalid JSON: {e}"))
        })?;
        let is_leaf = |v: &Value| v.get(LEAF_KEY).is_some();
        let mut params = BTreeMap::new();
        for (name, leaf) in flatten(&value, &is_leaf) {
            let record: ParamMetadata = serde_json::from_value(leaf).map_err(|e| {
                ThetaError::metadata_decode(path, Some(&name.to_string()), e.to_string())
            })?;
            params.insert(name, record);
        }
        Ok(Self { params })
    }

    /// Render the canonical byte form: nested, sorted keys, 4-space indent.
    pub fn serialize(&self) -> Result<String> {
        let flat: BTreeMap<ParamName, Value> = self
            .params
            .iter()
            .map(|(name, record)| Ok((name.clone(), serde_json::to_value(record)?)))
            .collect::<Result<_>>()?;
        let nested = unflatten(&flat)?;
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        nested.serialize(&mut serializer)?;
        Ok(String::from_utf8(out).expect("serde_json emits UTF-8"))
    }

    /// Load the document as committed at `reference`, empty when the path or
    /// ref does not exist yet.
    pub async fn from_commit(
        repo: &dyn Repository,
        path: &str,
        reference: &str,
    ) -> Result<Self> {
        match repo.file_at_commit(path, reference).await? {
            None => Ok(Self::new()),
            Some(bytes) => Self::parse(&bytes, Some(path)),
        }
    }

    /// Three-way difference against an older document: `(added, removed,
    /// modified)`, where modified means same key but a different
    /// object-store OID.
    pub fn diff(&self, other: &Metadata) -> (Metadata, Metadata, Metadata) {
        let mut added = Metadata::new();
        let mut removed = Metadata::new();
        let mut modified = Metadata::new();
        for (name, record) in &self.params {
            match other.params.get(name) {
                None => added.insert(name.clone(), record.clone()),
                Some(old) if old.lfs_metadata.oid != record.lfs_metadata.oid => {
                    modified.insert(name.clone(), record.clone())
                }
                Some(_) => {}
            }
        }
        for (name, record) in &other.params {
            if !self.params.contains_key(name) {
                removed.insert(name.clone(), record.clone());
            }
        }
        (added, removed, modified)
    }

    /// Check that every signature in the document has the configured length.
    pub fn validate_signature_size(&self, signature_size: usize) -> Result<()> {
        for (name, record) in &self.params {
            if record.tensor_metadata.hash.len() != signature_size {
                return Err(ThetaError::integrity(format!(
                    "parameter '{name}' has a signature of length {}, expected {signature_size}",
                    record.tensor_metadata.hash.len()
                )));
            }
        }
        Ok(())
    }
}

/// Build a fresh record from its three parts.
pub fn param_metadata(
    tensor_metadata: TensorMetadata,
    lfs_metadata: LfsMetadata,
    update_type: &str,
    last_commit: &str,
) -> ParamMetadata {
    ParamMetadata {
        tensor_metadata,
        lfs_metadata,
        theta_metadata: ThetaMetadata {
            update_type: update_type.to_string(),
            last_commit: last_commit.to_string(),
        },
    }
}

/// Convenience for code that only has a [`Signature`] to hand.
pub fn tensor_metadata_with_hash(tensor: &Tensor, hash: Signature) -> TensorMetadata {
    TensorMetadata {
        shape: tensor.shape().to_vec(),
        dtype: tensor.dtype().to_string(),
        hash,
    }
}
