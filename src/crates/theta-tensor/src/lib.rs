//! # theta-tensor
//!
//! Tensor model and serialization for git-theta: a dtype-tagged [`Tensor`]
//! whose arithmetic runs in `f64`, a chunked self-describing [`codec`], and a
//! [`bundle`] packer that turns many encoded tensors into one blob for the
//! object store.

pub mod bundle;
pub mod codec;
pub mod error;
pub mod tensor;

pub use bundle::{bundle as pack, unbundle as unpack, FileMap};
pub use error::{Result, TensorError};
pub use tensor::{Dtype, Tensor};
