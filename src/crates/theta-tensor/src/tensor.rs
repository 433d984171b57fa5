//! Dtype-tagged tensors.
//!
//! A [`Tensor`] is a shape, a [`Dtype`], and a raw little-endian byte buffer.
//! Arithmetic goes through `f64`: values are upcast on read and re-encoded in
//! the original dtype on write, so one code path serves every element width.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorError};

/// Element type of a tensor, named numpy-style: byte order, kind, width.
///
/// Only little-endian layouts are supported; checkpoints produced on
/// big-endian hosts are expected to byte-swap before handing data over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dtype {
    F32,
    F64,
    I16,
    I32,
    I64,
    U8,
}

impl Dtype {
    /// Width of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::I16 => 2,
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
        }
    }

    /// The canonical string form, e.g. `<f4`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::F32 => "<f4",
            Dtype::F64 => "<f8",
            Dtype::I16 => "<i2",
            Dtype::I32 => "<i4",
            Dtype::I64 => "<i8",
            Dtype::U8 => "<u1",
        }
    }

    fn read(&self, bytes: &[u8]) -> f64 {
        match self {
            Dtype::F32 => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::F64 => f64::from_le_bytes(bytes.try_into().unwrap()),
            Dtype::I16 => i16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::I32 => i32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::I64 => i64::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::U8 => bytes[0] as f64,
        }
    }

    fn write(&self, value: f64, out: &mut Vec<u8>) {
        match self {
            Dtype::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Dtype::F64 => out.extend_from_slice(&value.to_le_bytes()),
            Dtype::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            Dtype::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            Dtype::I64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            Dtype::U8 => out.push(value as u8),
        }
    }
}

impl FromStr for Dtype {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "<f4" => Ok(Dtype::F32),
            "<f8" => Ok(Dtype::F64),
            "<i2" => Ok(Dtype::I16),
            "<i4" => Ok(Dtype::I32),
            "<i8" => Ok(Dtype::I64),
            "<u1" | "|u1" => Ok(Dtype::U8),
            other => Err(TensorError::UnknownDtype(other.to_string())),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Dtype {
    type Error = TensorError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Dtype> for String {
    fn from(d: Dtype) -> String {
        d.as_str().to_string()
    }
}

/// A multi-dimensional array of IEEE-754 or integer values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: Dtype,
    data: Vec<u8>,
}

impl Tensor {
    /// Wrap a raw buffer, checking that its length matches the shape.
    pub fn new(shape: Vec<usize>, dtype: Dtype, data: Vec<u8>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel * dtype.size() {
            return Err(TensorError::BufferSize {
                shape,
                dtype: dtype.to_string(),
                buffer: data.len(),
            });
        }
        Ok(Self { shape, dtype, data })
    }

    /// Build a tensor by encoding `f64` values into `dtype`.
    pub fn from_f64s(shape: Vec<usize>, dtype: Dtype, values: &[f64]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if values.len() != numel {
            return Err(TensorError::BufferSize {
                shape,
                dtype: dtype.to_string(),
                buffer: values.len() * dtype.size(),
            });
        }
        let mut data = Vec::with_capacity(values.len() * dtype.size());
        for v in values {
            dtype.write(*v, &mut data);
        }
        Ok(Self { shape, dtype, data })
    }

    /// Convenience constructor from `f32` values.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let upcast: Vec<f64> = values.iter().map(|v| *v as f64).collect();
        Self::from_f64s(shape, Dtype::F32, &upcast)
    }

    /// Convenience constructor from `f64` values.
    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        Self::from_f64s(shape, Dtype::F64, values)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Flatten to `f64`, upcasting each element.
    pub fn to_f64s(&self) -> Vec<f64> {
        let width = self.dtype.size();
        self.data
            .chunks_exact(width)
            .map(|c| self.dtype.read(c))
            .collect()
    }

    /// Rebuild a tensor of the same shape and dtype from `f64` values.
    pub fn with_values(&self, values: &[f64]) -> Result<Self> {
        Self::from_f64s(self.shape.clone(), self.dtype, values)
    }

    /// Element-wise closeness, numpy-style: `|a - b| <= atol + rtol * |b|`.
    pub fn allclose(&self, other: &Tensor, rtol: f64, atol: f64) -> bool {
        if self.shape != other.shape {
            return false;
        }
        self.to_f64s()
            .iter()
            .zip(other.to_f64s())
            .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }

    /// Element-wise sum. The result keeps `self`'s dtype.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise difference. The result keeps `self`'s dtype.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    fn zip_with(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(TensorError::DimensionMismatch {
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        let values: Vec<f64> = self
            .to_f64s()
            .iter()
            .zip(other.to_f64s())
            .map(|(a, b)| f(*a, b))
            .collect();
        self.with_values(&values)
    }

    /// Multiply by a broadcastable tensor, numpy broadcast rules: shapes are
    /// aligned from the trailing axis and each axis must match or be 1 on the
    /// multiplier side.
    pub fn mul_broadcast(&self, multiplier: &Tensor) -> Result<Tensor> {
        let out_shape = &self.shape;
        if multiplier.ndim() > self.ndim() {
            return Err(TensorError::DimensionMismatch {
                lhs: self.shape.clone(),
                rhs: multiplier.shape.clone(),
            });
        }
        // Pad the multiplier's shape with leading 1s so both have equal rank.
        let mut m_shape = vec![1usize; self.ndim() - multiplier.ndim()];
        m_shape.extend_from_slice(multiplier.shape());
        for (s, m) in out_shape.iter().zip(&m_shape) {
            if *m != 1 && m != s {
                return Err(TensorError::DimensionMismatch {
                    lhs: self.shape.clone(),
                    rhs: multiplier.shape.clone(),
                });
            }
        }
        let m_strides = contiguous_strides(&m_shape);
        let m_values = multiplier.to_f64s();
        let values: Vec<f64> = self
            .to_f64s()
            .iter()
            .enumerate()
            .map(|(flat, v)| {
                let mut m_flat = 0usize;
                let mut rem = flat;
                for (axis, dim) in out_shape.iter().enumerate().rev() {
                    let idx = rem % dim;
                    rem /= dim;
                    if m_shape[axis] != 1 {
                        m_flat += idx * m_strides[axis];
                    }
                }
                v * m_values[m_flat]
            })
            .collect();
        self.with_values(&values)
    }

    /// 2-D matrix product in `f64`. Both operands must be rank 2.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.ndim() != 2 || other.ndim() != 2 || self.shape[1] != other.shape[0] {
            return Err(TensorError::DimensionMismatch {
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        let (m, k) = (self.shape[0], self.shape[1]);
        let n = other.shape[1];
        let a = self.to_f64s();
        let b = other.to_f64s();
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_il = a[i * k + l];
                if a_il == 0.0 {
                    continue;
                }
                for j in 0..n {
                    out[i * n + j] += a_il * b[l * n + j];
                }
            }
        }
        Tensor::from_f64s(vec![m, n], self.dtype, &out)
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_string_round_trip() {
        for s in ["<f4", "<f8", "<i2", "<i4", "<i8", "<u1"] {
            let d: Dtype = s.parse().unwrap();
            assert_eq!(d.to_string(), s);
        }
        assert!("float32".parse::<Dtype>().is_err());
    }

    #[test]
    fn buffer_size_checked() {
        assert!(Tensor::new(vec![2, 2], Dtype::F32, vec![0u8; 16]).is_ok());
        assert!(Tensor::new(vec![2, 2], Dtype::F32, vec![0u8; 15]).is_err());
    }

    #[test]
    fn upcast_round_trip() {
        let t = Tensor::from_f32(vec![4], &[1.0, 2.5, -3.0, 0.0]).unwrap();
        assert_eq!(t.to_f64s(), vec![1.0, 2.5, -3.0, 0.0]);
        let back = t.with_values(&t.to_f64s()).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn add_sub_inverse() {
        let a = Tensor::from_f64(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_f64(vec![3], &[0.5, -1.0, 4.0]).unwrap();
        let diff = a.sub(&b).unwrap();
        assert_eq!(diff.add(&b).unwrap(), a);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let a = Tensor::from_f64(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_f64(vec![2], &[1.0, 2.0]).unwrap();
        assert!(matches!(
            a.add(&b),
            Err(TensorError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn broadcast_multiply_rows() {
        // [2, 3] * [1, 3] scales columns.
        let a = Tensor::from_f64(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let m = Tensor::from_f64(vec![1, 3], &[2.0, 0.0, 1.0]).unwrap();
        let out = a.mul_broadcast(&m).unwrap();
        assert_eq!(out.to_f64s(), vec![2.0, 0.0, 3.0, 8.0, 0.0, 6.0]);
    }

    #[test]
    fn broadcast_multiply_lower_rank() {
        // [2, 2] * [2] broadcasts over the leading axis.
        let a = Tensor::from_f64(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let m = Tensor::from_f64(vec![2], &[10.0, 100.0]).unwrap();
        let out = a.mul_broadcast(&m).unwrap();
        assert_eq!(out.to_f64s(), vec![10.0, 200.0, 30.0, 400.0]);
    }

    #[test]
    fn matmul_small() {
        let a = Tensor::from_f64(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_f64(vec![2, 1], &[1.0, 1.0]).unwrap();
        let out = a.matmul(&b).unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert_eq!(out.to_f64s(), vec![3.0, 7.0]);
    }

    #[test]
    fn allclose_tolerances() {
        let a = Tensor::from_f64(vec![2], &[1.0, 2.0]).unwrap();
        let b = Tensor::from_f64(vec![2], &[1.0 + 1e-9, 2.0]).unwrap();
        assert!(a.allclose(&b, 1e-5, 1e-8));
        let c = Tensor::from_f64(vec![2], &[1.1, 2.0]).unwrap();
        assert!(!a.allclose(&c, 1e-5, 1e-8));
    }
}
