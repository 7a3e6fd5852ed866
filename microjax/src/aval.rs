//! Abstract values: the static types of the IR.
//!
//! A [`ShapedArray`] is shape plus dtype. An [`Aval`] is either that alone or
//! a `Concrete` level that additionally captures the buffer the value is
//! known to hold; the jaxpr trace uses the concrete level for constant
//! folding. Equality is structural on (shape, dtype) at both levels.

use crate::array::ArrayRef;
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape + dtype: the static type of an array-valued expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapedArray {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl ShapedArray {
    pub fn new(shape: Vec<usize>, dtype: DType) -> ShapedArray {
        ShapedArray { shape, dtype }
    }

    pub fn scalar(dtype: DType) -> ShapedArray {
        ShapedArray {
            shape: vec![],
            dtype,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }
}

impl fmt::Display for ShapedArray {
    /// Text-form rendering: `f32[2,3]`, scalars as `f32[]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// An abstract value, possibly refined by a captured concrete buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Aval {
    Shaped(ShapedArray),
    Concrete { aval: ShapedArray, value: ArrayRef },
}

impl Aval {
    pub fn shaped(&self) -> &ShapedArray {
        match self {
            Aval::Shaped(a) => a,
            Aval::Concrete { aval, .. } => aval,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shaped().shape
    }

    pub fn dtype(&self) -> DType {
        self.shaped().dtype
    }

    /// The captured buffer, when this value is known.
    pub fn concrete_value(&self) -> Option<&ArrayRef> {
        match self {
            Aval::Shaped(_) => None,
            Aval::Concrete { value, .. } => Some(value),
        }
    }

    /// Forget the concrete refinement.
    pub fn to_shaped(&self) -> ShapedArray {
        self.shaped().clone()
    }
}

impl PartialEq for Aval {
    fn eq(&self, other: &Self) -> bool {
        self.shaped() == other.shaped()
    }
}

/// Broadcast two shapes, aligned from the trailing axis: equal extents
/// match, an extent of 1 broadcasts, anything else is an error.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i < rank - a.len() {
            1
        } else {
            a[i - (rank - a.len())]
        };
        let db = if i < rank - b.len() {
            1
        } else {
            b[i - (rank - b.len())]
        };
        let d = if da == db {
            da
        } else if da == 1 {
            db
        } else if db == 1 {
            da
        } else {
            return Err(TraceError::ShapeMismatch(format!(
                "cannot broadcast {a:?} with {b:?}"
            )));
        };
        out.push(d);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_text_form() {
        assert_eq!(
            ShapedArray::new(vec![2, 3], DType::F32).to_string(),
            "f32[2,3]"
        );
        assert_eq!(ShapedArray::scalar(DType::Bool).to_string(), "bool[]");
    }

    #[test]
    fn broadcasting_aligns_trailing_axes() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shapes(&[2, 1], &[1, 5]).unwrap(), vec![2, 5]);
        assert_eq!(broadcast_shapes(&[], &[4]).unwrap(), vec![4]);
        assert!(broadcast_shapes(&[2, 3], &[2]).is_err());
    }

    #[test]
    fn aval_equality_ignores_the_concrete_refinement() {
        let sa = ShapedArray::scalar(DType::F64);
        let concrete = Aval::Concrete {
            aval: sa.clone(),
            value: std::rc::Rc::new(crate::array::ArrayValue::from_scalar(3.0, DType::F64)),
        };
        assert_eq!(Aval::Shaped(sa), concrete);
    }
}
