//! Concrete array buffers.
//!
//! Storage is dtype-segregated: one typed `Vec` per element type, row-major.
//! The core treats buffers as backend-owned and only passes [`ArrayRef`]
//! handles around; kernels living in a backend crate do the actual work.

use crate::aval::ShapedArray;
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use half::f16;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// The `c64` element type: a complex number of two `f32` components.
pub type C64 = Complex<f32>;

/// Dtype-segregated element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    C64(Vec<C64>),
}

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Bool(_) => DType::Bool,
            ArrayData::I32(_) => DType::I32,
            ArrayData::I64(_) => DType::I64,
            ArrayData::F16(_) => DType::F16,
            ArrayData::F32(_) => DType::F32,
            ArrayData::F64(_) => DType::F64,
            ArrayData::C64(_) => DType::C64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Bool(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F16(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::C64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completion token returned by [`ArrayValue::block_until_ready`].
///
/// The CPU backend is synchronous, so the token is always `Ready`;
/// asynchronous backends surface deferred errors here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ready,
}

/// A dense row-major array: shape plus element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    shape: Vec<usize>,
    data: ArrayData,
}

/// Shared handle to an immutable array buffer.
pub type ArrayRef = Rc<ArrayValue>;

impl ArrayValue {
    /// Build an array, checking that the element count matches the shape.
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<ArrayValue> {
        let size: usize = shape.iter().product();
        if size != data.len() {
            return Err(TraceError::ShapeMismatch(format!(
                "buffer of {} elements cannot have shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(ArrayValue { shape, data })
    }

    /// A rank-0 array holding one element of the given dtype.
    pub fn from_scalar(v: f64, dtype: DType) -> ArrayValue {
        let data = match dtype {
            DType::Bool => ArrayData::Bool(vec![v != 0.0]),
            DType::I32 => ArrayData::I32(vec![v as i32]),
            DType::I64 => ArrayData::I64(vec![v as i64]),
            DType::F16 => ArrayData::F16(vec![f16::from_f64(v)]),
            DType::F32 => ArrayData::F32(vec![v as f32]),
            DType::F64 => ArrayData::F64(vec![v]),
            DType::C64 => ArrayData::C64(vec![Complex::new(v as f32, 0.0)]),
        };
        ArrayValue {
            shape: vec![],
            data,
        }
    }

    /// Build an array from a typed host buffer (the backend constructor of
    /// the external interface).
    pub fn from_typed_buffer(shape: &[usize], data: ArrayData) -> Result<ArrayValue> {
        ArrayValue::new(shape.to_vec(), data)
    }

    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<ArrayValue> {
        ArrayValue::new(shape.to_vec(), ArrayData::F32(data))
    }

    pub fn from_f64(shape: &[usize], data: Vec<f64>) -> Result<ArrayValue> {
        ArrayValue::new(shape.to_vec(), ArrayData::F64(data))
    }

    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<ArrayValue> {
        ArrayValue::new(shape.to_vec(), ArrayData::I32(data))
    }

    pub fn from_i64(shape: &[usize], data: Vec<i64>) -> Result<ArrayValue> {
        ArrayValue::new(shape.to_vec(), ArrayData::I64(data))
    }

    pub fn from_bool(shape: &[usize], data: Vec<bool>) -> Result<ArrayValue> {
        ArrayValue::new(shape.to_vec(), ArrayData::Bool(data))
    }

    /// An array of zeros with the given abstract value.
    pub fn zeros(aval: &ShapedArray) -> ArrayValue {
        Self::filled(aval, 0.0)
    }

    /// An array of ones with the given abstract value.
    pub fn ones(aval: &ShapedArray) -> ArrayValue {
        Self::filled(aval, 1.0)
    }

    fn filled(aval: &ShapedArray, v: f64) -> ArrayValue {
        let n = aval.size();
        let data = match aval.dtype {
            DType::Bool => ArrayData::Bool(vec![v != 0.0; n]),
            DType::I32 => ArrayData::I32(vec![v as i32; n]),
            DType::I64 => ArrayData::I64(vec![v as i64; n]),
            DType::F16 => ArrayData::F16(vec![f16::from_f64(v); n]),
            DType::F32 => ArrayData::F32(vec![v as f32; n]),
            DType::F64 => ArrayData::F64(vec![v; n]),
            DType::C64 => ArrayData::C64(vec![Complex::new(v as f32, 0.0); n]),
        };
        ArrayValue {
            shape: aval.shape.clone(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn aval(&self) -> ShapedArray {
        ShapedArray::new(self.shape.clone(), self.dtype())
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Read one element as `f64`. Complex elements are refused.
    pub fn get_f64(&self, i: usize) -> Result<f64> {
        if i >= self.size() {
            return Err(TraceError::Backend(format!(
                "index {} out of bounds for {} elements",
                i,
                self.size()
            )));
        }
        Ok(match &self.data {
            ArrayData::Bool(v) => {
                if v[i] {
                    1.0
                } else {
                    0.0
                }
            }
            ArrayData::I32(v) => f64::from(v[i]),
            ArrayData::I64(v) => v[i] as f64,
            ArrayData::F16(v) => v[i].to_f64(),
            ArrayData::F32(v) => f64::from(v[i]),
            ArrayData::F64(v) => v[i],
            ArrayData::C64(_) => {
                return Err(TraceError::DTypeMismatch(
                    "cannot read a complex element as f64".into(),
                ))
            }
        })
    }

    /// Read back the whole buffer as `f64`, in row-major order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        (0..self.size()).map(|i| self.get_f64(i)).collect()
    }

    pub fn to_bool_vec(&self) -> Result<Vec<bool>> {
        match &self.data {
            ArrayData::Bool(v) => Ok(v.clone()),
            other => Err(TraceError::DTypeMismatch(format!(
                "expected bool data, got {}",
                other.dtype()
            ))),
        }
    }

    /// The single element of a rank-0 array, as `f64`.
    pub fn scalar_f64(&self) -> Result<f64> {
        if !self.is_scalar() {
            return Err(TraceError::ShapeMismatch(format!(
                "expected a scalar, got shape {:?}",
                self.shape
            )));
        }
        self.get_f64(0)
    }

    /// Elementwise coercion to another dtype.
    ///
    /// Complex sources only convert to complex targets; every real source
    /// converts to any target.
    pub fn astype(&self, dtype: DType) -> Result<ArrayValue> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        if self.dtype().is_complex() && !dtype.is_complex() {
            return Err(TraceError::DTypeMismatch(format!(
                "cannot convert {} to {}",
                self.dtype(),
                dtype
            )));
        }
        let n = self.size();
        let data = match dtype {
            DType::Bool => {
                ArrayData::Bool((0..n).map(|i| self.get_f64(i).map(|v| v != 0.0)).collect::<Result<_>>()?)
            }
            DType::I32 => {
                ArrayData::I32((0..n).map(|i| self.get_f64(i).map(|v| v as i32)).collect::<Result<_>>()?)
            }
            DType::I64 => {
                ArrayData::I64((0..n).map(|i| self.get_f64(i).map(|v| v as i64)).collect::<Result<_>>()?)
            }
            DType::F16 => ArrayData::F16(
                (0..n)
                    .map(|i| self.get_f64(i).map(f16::from_f64))
                    .collect::<Result<_>>()?,
            ),
            DType::F32 => {
                ArrayData::F32((0..n).map(|i| self.get_f64(i).map(|v| v as f32)).collect::<Result<_>>()?)
            }
            DType::F64 => ArrayData::F64((0..n).map(|i| self.get_f64(i)).collect::<Result<_>>()?),
            DType::C64 => match &self.data {
                ArrayData::C64(v) => ArrayData::C64(v.clone()),
                _ => ArrayData::C64(
                    (0..n)
                        .map(|i| self.get_f64(i).map(|v| Complex::new(v as f32, 0.0)))
                        .collect::<Result<_>>()?,
                ),
            },
        };
        ArrayValue::new(self.shape.clone(), data)
    }

    /// Canonical byte fingerprint of dtype, shape, and contents; used as a
    /// structural-equality key for jit static arguments.
    pub fn fingerprint(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.size() * 8);
        out.push(self.dtype() as u8);
        out.extend_from_slice(&(self.rank() as u64).to_le_bytes());
        for d in &self.shape {
            out.extend_from_slice(&(*d as u64).to_le_bytes());
        }
        match &self.data {
            ArrayData::Bool(v) => out.extend(v.iter().map(|b| u8::from(*b))),
            ArrayData::I32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            ArrayData::I64(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            ArrayData::F16(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_bits().to_le_bytes());
                }
            }
            ArrayData::F32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_bits().to_le_bytes());
                }
            }
            ArrayData::F64(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_bits().to_le_bytes());
                }
            }
            ArrayData::C64(v) => {
                for x in v {
                    out.extend_from_slice(&x.re.to_bits().to_le_bytes());
                    out.extend_from_slice(&x.im.to_bits().to_le_bytes());
                }
            }
        }
        out
    }

    /// Await buffer readiness. Synchronous backends return immediately;
    /// deferred backend errors would surface at this point.
    pub fn block_until_ready(&self) -> Completion {
        Completion::Ready
    }
}

impl Hash for ArrayValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let a = ArrayValue::from_scalar(2.5, DType::F32);
        assert_eq!(a.shape(), &[] as &[usize]);
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.scalar_f64().unwrap(), 2.5);
    }

    #[test]
    fn shape_size_checked() {
        assert!(ArrayValue::from_f32(&[2, 3], vec![0.0; 5]).is_err());
        assert!(ArrayValue::from_f32(&[2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn astype_widens_and_refuses_complex_narrowing() {
        let a = ArrayValue::from_i32(&[3], vec![1, 2, 3]).unwrap();
        let b = a.astype(DType::F64).unwrap();
        assert_eq!(b.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);

        let c = a.astype(DType::C64).unwrap();
        assert!(c.astype(DType::F32).is_err());
    }

    #[test]
    fn fingerprints_distinguish_contents() {
        let a = ArrayValue::from_f32(&[2], vec![1.0, 2.0]).unwrap();
        let b = ArrayValue::from_f32(&[2], vec![1.0, 3.0]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }
}
