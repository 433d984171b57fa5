//! Error types for tensor encoding and decoding

use thiserror::Error;

/// Result type for tensor operations
pub type Result<T> = std::result::Result<T, TensorError>;

/// Errors that can occur while building, encoding, or decoding tensors
#[derive(Error, Debug)]
pub enum TensorError {
    /// Unknown or malformed dtype string
    #[error("Unknown dtype: {0:?}")]
    UnknownDtype(String),

    /// Buffer length does not match shape * element width
    #[error("Buffer of {buffer} bytes does not hold a {dtype} tensor of shape {shape:?}")]
    BufferSize {
        shape: Vec<usize>,
        dtype: String,
        buffer: usize,
    },

    /// Two tensors had incompatible shapes for the requested operation
    #[error("Dimension mismatch: {lhs:?} vs {rhs:?}")]
    DimensionMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    /// Malformed encoded input
    #[error("Decode error: {0}")]
    Decode(String),

    /// The encoded header's shape disagrees with the chunk extents
    #[error("Shape mismatch: header declares {expected} elements, chunks hold {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Header serialization error
    #[error("Header error: {0}")]
    Header(#[from] serde_json::Error),

    /// Bundle packing/unpacking error
    #[error("Bundle error: {0}")]
    Bundle(#[from] bincode::Error),
}

impl TensorError {
    /// Create a decode error with context
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}
