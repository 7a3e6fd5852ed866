//! Elementwise kernels.
//!
//! Binary kernels coerce both operands to the promoted dtype and
//! materialise the broadcast before the loop; everything after that is a
//! straight zip.

use crate::util::{expand, kernel_error};
use half::f16;
use microjax::aval::broadcast_shapes;
use microjax::error::Result;
use microjax::primitive::Params;
use microjax::{ArrayData, ArrayRef, ArrayValue, DType};
use std::rc::Rc;

/// Coerce a binary pair to a common dtype and shape.
fn coerce_pair(a: &ArrayValue, b: &ArrayValue) -> Result<(ArrayValue, ArrayValue, Vec<usize>)> {
    let shape = broadcast_shapes(a.shape(), b.shape())?;
    let dtype = DType::promote(a.dtype(), b.dtype());
    let a = expand(&a.astype(dtype)?, &shape)?;
    let b = expand(&b.astype(dtype)?, &shape)?;
    Ok((a, b, shape))
}

fn expect_binary(args: &[ArrayRef]) -> Result<(&ArrayValue, &ArrayValue)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(kernel_error(format!("expected 2 inputs, got {}", args.len()))),
    }
}

fn expect_unary(args: &[ArrayRef]) -> Result<&ArrayValue> {
    match args {
        [a] => Ok(a),
        _ => Err(kernel_error(format!("expected 1 input, got {}", args.len()))),
    }
}

fn output(shape: Vec<usize>, data: ArrayData) -> Result<Vec<ArrayRef>> {
    Ok(vec![Rc::new(ArrayValue::new(shape, data)?)])
}

macro_rules! zip_numeric {
    ($a:expr, $b:expr, |$x:ident, $y:ident| $body:expr) => {
        match ($a.data(), $b.data()) {
            (ArrayData::I32(xs), ArrayData::I32(ys)) => ArrayData::I32(
                xs.iter().zip(ys).map(|(&$x, &$y)| $body).collect(),
            ),
            (ArrayData::I64(xs), ArrayData::I64(ys)) => ArrayData::I64(
                xs.iter().zip(ys).map(|(&$x, &$y)| $body).collect(),
            ),
            (ArrayData::F16(xs), ArrayData::F16(ys)) => ArrayData::F16(
                xs.iter().zip(ys).map(|(&$x, &$y)| $body).collect(),
            ),
            (ArrayData::F32(xs), ArrayData::F32(ys)) => ArrayData::F32(
                xs.iter().zip(ys).map(|(&$x, &$y)| $body).collect(),
            ),
            (ArrayData::F64(xs), ArrayData::F64(ys)) => ArrayData::F64(
                xs.iter().zip(ys).map(|(&$x, &$y)| $body).collect(),
            ),
            (ArrayData::C64(xs), ArrayData::C64(ys)) => ArrayData::C64(
                xs.iter().zip(ys).map(|(&$x, &$y)| $body).collect(),
            ),
            _ => return Err(kernel_error("non-numeric or mismatched operands")),
        }
    };
}

pub(crate) fn add(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = expect_binary(args)?;
    let (a, b, shape) = coerce_pair(a, b)?;
    let data = zip_numeric!(a, b, |x, y| x + y);
    output(shape, data)
}

pub(crate) fn sub(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = expect_binary(args)?;
    let (a, b, shape) = coerce_pair(a, b)?;
    let data = zip_numeric!(a, b, |x, y| x - y);
    output(shape, data)
}

pub(crate) fn mul(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = expect_binary(args)?;
    let (a, b, shape) = coerce_pair(a, b)?;
    let data = zip_numeric!(a, b, |x, y| x * y);
    output(shape, data)
}

pub(crate) fn div(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = expect_binary(args)?;
    let (a, b, shape) = coerce_pair(a, b)?;
    // Integer division by zero is a backend error, not a panic.
    let data = match (a.data(), b.data()) {
        (ArrayData::I32(xs), ArrayData::I32(ys)) => ArrayData::I32(
            xs.iter()
                .zip(ys)
                .map(|(x, y)| {
                    if *y == 0 {
                        Err(kernel_error("integer division by zero"))
                    } else {
                        Ok(x / y)
                    }
                })
                .collect::<Result<_>>()?,
        ),
        (ArrayData::I64(xs), ArrayData::I64(ys)) => ArrayData::I64(
            xs.iter()
                .zip(ys)
                .map(|(x, y)| {
                    if *y == 0 {
                        Err(kernel_error("integer division by zero"))
                    } else {
                        Ok(x / y)
                    }
                })
                .collect::<Result<_>>()?,
        ),
        _ => zip_numeric!(a, b, |x, y| x / y),
    };
    output(shape, data)
}

pub(crate) fn neg(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let a = expect_unary(args)?;
    let data = match a.data() {
        ArrayData::I32(v) => ArrayData::I32(v.iter().map(|x| -x).collect()),
        ArrayData::I64(v) => ArrayData::I64(v.iter().map(|x| -x).collect()),
        ArrayData::F16(v) => ArrayData::F16(v.iter().map(|x| -*x).collect()),
        ArrayData::F32(v) => ArrayData::F32(v.iter().map(|x| -x).collect()),
        ArrayData::F64(v) => ArrayData::F64(v.iter().map(|x| -x).collect()),
        ArrayData::C64(v) => ArrayData::C64(v.iter().map(|x| -x).collect()),
        ArrayData::Bool(_) => return Err(kernel_error("negation of bool data")),
    };
    output(a.shape().to_vec(), data)
}

macro_rules! float_unary {
    ($name:ident, $f32_op:ident, $c64_op:ident) => {
        pub(crate) fn $name(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
            let a = expect_unary(args)?;
            let data = match a.data() {
                ArrayData::F16(v) => ArrayData::F16(
                    v.iter()
                        .map(|x| f16::from_f32(x.to_f32().$f32_op()))
                        .collect(),
                ),
                ArrayData::F32(v) => {
                    ArrayData::F32(v.iter().map(|x| x.$f32_op()).collect())
                }
                ArrayData::F64(v) => {
                    ArrayData::F64(v.iter().map(|x| x.$f32_op()).collect())
                }
                ArrayData::C64(v) => {
                    ArrayData::C64(v.iter().map(|x| x.$c64_op()).collect())
                }
                _ => {
                    return Err(kernel_error(concat!(
                        stringify!($name),
                        " of non-float data"
                    )))
                }
            };
            output(a.shape().to_vec(), data)
        }
    };
}

float_unary!(sin, sin, sin);
float_unary!(cos, cos, cos);
float_unary!(exp, exp, exp);
float_unary!(log, ln, ln);
float_unary!(sqrt, sqrt, sqrt);

macro_rules! compare_ordered {
    ($a:expr, $b:expr, $op:tt) => {
        match ($a.data(), $b.data()) {
            (ArrayData::Bool(xs), ArrayData::Bool(ys)) => {
                xs.iter().zip(ys).map(|(x, y)| x $op y).collect()
            }
            (ArrayData::I32(xs), ArrayData::I32(ys)) => {
                xs.iter().zip(ys).map(|(x, y)| x $op y).collect()
            }
            (ArrayData::I64(xs), ArrayData::I64(ys)) => {
                xs.iter().zip(ys).map(|(x, y)| x $op y).collect()
            }
            (ArrayData::F16(xs), ArrayData::F16(ys)) => {
                xs.iter().zip(ys).map(|(x, y)| x $op y).collect()
            }
            (ArrayData::F32(xs), ArrayData::F32(ys)) => {
                xs.iter().zip(ys).map(|(x, y)| x $op y).collect()
            }
            (ArrayData::F64(xs), ArrayData::F64(ys)) => {
                xs.iter().zip(ys).map(|(x, y)| x $op y).collect()
            }
            _ => return Err(kernel_error("unordered operands")),
        }
    };
}

pub(crate) fn greater(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = expect_binary(args)?;
    let (a, b, shape) = coerce_pair(a, b)?;
    let bools: Vec<bool> = compare_ordered!(a, b, >);
    output(shape, ArrayData::Bool(bools))
}

pub(crate) fn less(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = expect_binary(args)?;
    let (a, b, shape) = coerce_pair(a, b)?;
    let bools: Vec<bool> = compare_ordered!(a, b, <);
    output(shape, ArrayData::Bool(bools))
}

pub(crate) fn equal(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = expect_binary(args)?;
    let (a, b, shape) = coerce_pair(a, b)?;
    let bools: Vec<bool> = match (a.data(), b.data()) {
        (ArrayData::C64(xs), ArrayData::C64(ys)) => {
            xs.iter().zip(ys).map(|(x, y)| x == y).collect()
        }
        _ => compare_ordered!(a, b, ==),
    };
    output(shape, ArrayData::Bool(bools))
}

pub(crate) fn convert(args: &[ArrayRef], params: &Params) -> Result<Vec<ArrayRef>> {
    let a = expect_unary(args)?;
    let dtype = params.dtype("dtype")?;
    Ok(vec![Rc::new(a.astype(dtype)?)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(shape: &[usize], data: &[f64]) -> ArrayRef {
        Rc::new(ArrayValue::from_f64(shape, data.to_vec()).unwrap())
    }

    #[test]
    fn add_broadcasts_a_scalar() {
        let out = add(&[arr(&[2, 2], &[1.0, 2.0, 3.0, 4.0]), arr(&[], &[10.0])], &Params::new())
            .unwrap();
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn mixed_dtypes_promote() {
        let a = Rc::new(ArrayValue::from_i32(&[2], vec![1, 2]).unwrap());
        let b = arr(&[2], &[0.5, 0.5]);
        let out = mul(&[a, b], &Params::new()).unwrap();
        assert_eq!(out[0].dtype(), DType::F64);
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![0.5, 1.0]);
    }

    #[test]
    fn integer_division_by_zero_is_reported() {
        let a = Rc::new(ArrayValue::from_i64(&[1], vec![4]).unwrap());
        let b = Rc::new(ArrayValue::from_i64(&[1], vec![0]).unwrap());
        assert!(div(&[a, b], &Params::new()).is_err());
    }

    #[test]
    fn comparisons_produce_bools() {
        let out = greater(
            &[arr(&[3], &[1.0, 5.0, 3.0]), arr(&[3], &[2.0, 2.0, 3.0])],
            &Params::new(),
        )
        .unwrap();
        assert_eq!(out[0].to_bool_vec().unwrap(), vec![false, true, false]);
    }
}
