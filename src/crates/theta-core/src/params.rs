//! Serializing groups of tensors for the object store.
//!
//! Every update plug-in stores its payload as a named group of tensors (a
//! dense parameter, CSR triples, low-rank factors). The serializer encodes
//! each tensor through the chunked codec and packs the lot into a single
//! blob for the object store.

use std::collections::BTreeMap;

use theta_tensor::{codec, FileMap, Tensor};

use crate::error::Result;

/// Codec-plus-bundler for `name -> Tensor` groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateSerializer;

impl UpdateSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Encode every tensor and pack the group into one blob.
    pub fn serialize(&self, tensors: &BTreeMap<String, Tensor>) -> Result<Vec<u8>> {
        let mut files: FileMap = BTreeMap::new();
        for (name, tensor) in tensors {
            files.insert(name.clone(), codec::encode(tensor)?);
        }
        Ok(theta_tensor::pack(&files)?)
    }

    /// Unpack a blob back into its tensor group.
    pub fn deserialize(&self, blob: &[u8]) -> Result<BTreeMap<String, Tensor>> {
        let files = theta_tensor::unpack(blob)?;
        let mut tensors = BTreeMap::new();
        for (name, chunked) in files {
            tensors.insert(name, codec::decode(&chunked)?);
        }
        Ok(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_round_trip() {
        let serializer = UpdateSerializer::new();
        let mut group = BTreeMap::new();
        group.insert(
            "parameter".to_string(),
            Tensor::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
        );
        group.insert(
            "indices".to_string(),
            Tensor::from_f64s(vec![2], theta_tensor::Dtype::I64, &[0.0, 5.0]).unwrap(),
        );
        let blob = serializer.serialize(&group).unwrap();
        assert_eq!(serializer.deserialize(&blob).unwrap(), group);
    }

    #[test]
    fn deterministic_blobs() {
        let serializer = UpdateSerializer::new();
        let mut group = BTreeMap::new();
        group.insert(
            "parameter".to_string(),
            Tensor::from_f64(vec![4], &[0.0, 1.0, 2.0, 3.0]).unwrap(),
        );
        assert_eq!(
            serializer.serialize(&group).unwrap(),
            serializer.serialize(&group).unwrap()
        );
    }
}
