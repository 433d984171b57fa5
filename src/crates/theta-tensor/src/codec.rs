//! Chunked, self-describing tensor encoding.
//!
//! A tensor is encoded as a small keyed file set: a JSON `header` naming
//! `shape`, `dtype`, and `chunk_shape`, plus one or more data chunks keyed by
//! their grid coordinate along the leading axis (`"0"`, `"1"`, ...). Chunking
//! keeps any single buffer below [`MAX_CHUNK_BYTES`] so very large parameters
//! stream through without a doubled allocation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorError};
use crate::tensor::{Dtype, Tensor};

/// Upper bound on the byte length of a single encoded chunk.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

const HEADER_KEY: &str = "header";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    shape: Vec<usize>,
    dtype: Dtype,
    chunk_shape: Vec<usize>,
}

/// Encode a tensor into its keyed chunk map.
pub fn encode(tensor: &Tensor) -> Result<BTreeMap<String, Vec<u8>>> {
    let shape = tensor.shape().to_vec();
    let chunk_shape = chunk_shape_for(&shape, tensor.dtype());
    let header = Header {
        shape: shape.clone(),
        dtype: tensor.dtype(),
        chunk_shape: chunk_shape.clone(),
    };

    let mut files = BTreeMap::new();
    files.insert(HEADER_KEY.to_string(), serde_json::to_vec(&header)?);

    let chunk_bytes = chunk_byte_len(&chunk_shape, tensor.dtype());
    if chunk_bytes == 0 {
        files.insert("0".to_string(), Vec::new());
        return Ok(files);
    }
    for (idx, chunk) in tensor.data().chunks(chunk_bytes).enumerate() {
        files.insert(idx.to_string(), chunk.to_vec());
    }
    if tensor.data().is_empty() {
        files.insert("0".to_string(), Vec::new());
    }
    Ok(files)
}

/// Decode a keyed chunk map back into a tensor.
///
/// Fails with [`TensorError::ShapeMismatch`] when the header's shape
/// disagrees with the total chunk extent, and [`TensorError::Decode`] on a
/// missing header or missing chunk.
pub fn decode(files: &BTreeMap<String, Vec<u8>>) -> Result<Tensor> {
    let header_bytes = files
        .get(HEADER_KEY)
        .ok_or_else(|| TensorError::decode("missing tensor header"))?;
    let header: Header = serde_json::from_slice(header_bytes)?;

    let total_bytes = header.shape.iter().product::<usize>() * header.dtype.size();
    let chunk_bytes = chunk_byte_len(&header.chunk_shape, header.dtype);
    let n_chunks = if total_bytes == 0 || chunk_bytes == 0 {
        1
    } else {
        total_bytes.div_ceil(chunk_bytes)
    };

    let mut data = Vec::with_capacity(total_bytes);
    for idx in 0..n_chunks {
        let chunk = files
            .get(&idx.to_string())
            .ok_or_else(|| TensorError::decode(format!("missing chunk {idx}")))?;
        data.extend_from_slice(chunk);
    }
    if data.len() != total_bytes {
        return Err(TensorError::ShapeMismatch {
            expected: total_bytes / header.dtype.size().max(1),
            actual: data.len() / header.dtype.size().max(1),
        });
    }
    Tensor::new(header.shape, header.dtype, data)
}

/// Split the leading axis so one chunk stays under [`MAX_CHUNK_BYTES`].
fn chunk_shape_for(shape: &[usize], dtype: Dtype) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }
    let row_elems: usize = shape[1..].iter().product();
    let row_bytes = row_elems.max(1) * dtype.size();
    let rows_per_chunk = (MAX_CHUNK_BYTES / row_bytes).clamp(1, shape[0].max(1));
    let mut chunk = shape.to_vec();
    chunk[0] = rows_per_chunk;
    chunk
}

fn chunk_byte_len(chunk_shape: &[usize], dtype: Dtype) -> usize {
    chunk_shape.iter().product::<usize>() * dtype.size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip_single_chunk() {
        let t = Tensor::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let files = encode(&t).unwrap();
        assert!(files.contains_key("header"));
        assert!(files.contains_key("0"));
        assert_eq!(decode(&files).unwrap(), t);
    }

    #[test]
    fn round_trip_scalar_shape() {
        // A rank-0 tensor still holds one element.
        let t = Tensor::from_f64(vec![], &[7.5]).unwrap();
        let files = encode(&t).unwrap();
        assert_eq!(decode(&files).unwrap(), t);
    }

    #[test]
    fn round_trip_zero_length_axis() {
        let t = Tensor::from_f64(vec![0], &[]).unwrap();
        let files = encode(&t).unwrap();
        assert_eq!(decode(&files).unwrap(), t);
    }

    #[test]
    fn missing_header_is_decode_error() {
        let mut files = BTreeMap::new();
        files.insert("0".to_string(), vec![0u8; 4]);
        assert!(matches!(decode(&files), Err(TensorError::Decode(_))));
    }

    #[test]
    fn truncated_chunk_is_shape_mismatch() {
        let t = Tensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut files = encode(&t).unwrap();
        files.insert("0".to_string(), vec![0u8; 8]);
        assert!(matches!(
            decode(&files),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_header_is_decode_error() {
        let t = Tensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut files = encode(&t).unwrap();
        files.insert("header".to_string(), b"not json".to_vec());
        assert!(decode(&files).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_any_f32(values in proptest::collection::vec(-1e6f32..1e6f32, 1..256)) {
            let t = Tensor::from_f32(vec![values.len()], &values).unwrap();
            let files = encode(&t).unwrap();
            prop_assert_eq!(decode(&files).unwrap(), t);
        }
    }
}
