//! Packing keyed chunk maps into a single blob.
//!
//! Updates often carry several tensors (CSR triples, low-rank factors), each
//! already chunked by the codec. The bundle flattens the two-level
//! `name -> {chunk -> bytes}` map into one contiguous byte stream with
//! bincode over `BTreeMap`s: deterministic key order, length-prefixed
//! entries, no recompression of the (incompressible) float payload.

use std::collections::BTreeMap;

use crate::error::Result;

/// The two-level file map a bundle holds.
pub type FileMap = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Pack a file map into one blob.
pub fn bundle(files: &FileMap) -> Result<Vec<u8>> {
    Ok(bincode::serialize(files)?)
}

/// Unpack a blob produced by [`bundle`].
pub fn unbundle(blob: &[u8]) -> Result<FileMap> {
    Ok(bincode::deserialize(blob)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMap {
        let mut inner = BTreeMap::new();
        inner.insert("header".to_string(), b"{}".to_vec());
        inner.insert("0".to_string(), vec![1, 2, 3, 4]);
        let mut files = BTreeMap::new();
        files.insert("layers/0/weight".to_string(), inner);
        files.insert("layers/0/bias".to_string(), BTreeMap::new());
        files
    }

    #[test]
    fn round_trip() {
        let files = sample();
        let blob = bundle(&files).unwrap();
        assert_eq!(unbundle(&blob).unwrap(), files);
    }

    #[test]
    fn deterministic_bytes() {
        let files = sample();
        assert_eq!(bundle(&files).unwrap(), bundle(&files).unwrap());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(unbundle(b"definitely not bincode\xff\xff\xff\xff").is_err());
    }
}
