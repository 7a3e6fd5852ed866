//! Numpy-like surface operations.
//!
//! Thin wrappers from surface names onto `bind`; whether a call executes,
//! stages, differentiates, or broadcasts along a batch axis is decided by
//! the interpreter stack, not here. Constructors for concrete arrays live
//! alongside because literals are the other way values enter a program.

use crate::array::ArrayValue;
use crate::aval::ShapedArray;
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use crate::primitive::{ParamValue, Params};
use crate::trace::{bind1, Value};

/// A rank-0 concrete array.
pub fn scalar(v: f64, dtype: DType) -> Value {
    Value::concrete(ArrayValue::from_scalar(v, dtype))
}

/// A concrete `f32` array from row-major data.
pub fn array_f32(shape: &[usize], data: &[f32]) -> Result<Value> {
    Ok(Value::concrete(ArrayValue::from_f32(shape, data.to_vec())?))
}

/// A concrete `f64` array from row-major data.
pub fn array_f64(shape: &[usize], data: &[f64]) -> Result<Value> {
    Ok(Value::concrete(ArrayValue::from_f64(shape, data.to_vec())?))
}

/// A concrete `i64` array from row-major data.
pub fn array_i64(shape: &[usize], data: &[i64]) -> Result<Value> {
    Ok(Value::concrete(ArrayValue::from_i64(shape, data.to_vec())?))
}

/// Concrete zeros of the given type.
pub fn zeros(aval: &ShapedArray) -> Value {
    Value::concrete(ArrayValue::zeros(aval))
}

/// Concrete ones of the given type.
pub fn ones(aval: &ShapedArray) -> Value {
    Value::concrete(ArrayValue::ones(aval))
}

pub fn add(x: &Value, y: &Value) -> Result<Value> {
    bind1("add", vec![x.clone(), y.clone()], Params::new())
}

pub fn sub(x: &Value, y: &Value) -> Result<Value> {
    bind1("sub", vec![x.clone(), y.clone()], Params::new())
}

pub fn mul(x: &Value, y: &Value) -> Result<Value> {
    bind1("mul", vec![x.clone(), y.clone()], Params::new())
}

pub fn div(x: &Value, y: &Value) -> Result<Value> {
    bind1("div", vec![x.clone(), y.clone()], Params::new())
}

pub fn neg(x: &Value) -> Result<Value> {
    bind1("neg", vec![x.clone()], Params::new())
}

pub fn sin(x: &Value) -> Result<Value> {
    bind1("sin", vec![x.clone()], Params::new())
}

pub fn cos(x: &Value) -> Result<Value> {
    bind1("cos", vec![x.clone()], Params::new())
}

pub fn exp(x: &Value) -> Result<Value> {
    bind1("exp", vec![x.clone()], Params::new())
}

pub fn log(x: &Value) -> Result<Value> {
    bind1("log", vec![x.clone()], Params::new())
}

pub fn sqrt(x: &Value) -> Result<Value> {
    bind1("sqrt", vec![x.clone()], Params::new())
}

pub fn greater(x: &Value, y: &Value) -> Result<Value> {
    bind1("greater", vec![x.clone(), y.clone()], Params::new())
}

pub fn less(x: &Value, y: &Value) -> Result<Value> {
    bind1("less", vec![x.clone(), y.clone()], Params::new())
}

pub fn equal(x: &Value, y: &Value) -> Result<Value> {
    bind1("equal", vec![x.clone(), y.clone()], Params::new())
}

/// Elementwise conversion to another dtype. A no-op when the dtype already
/// matches.
pub fn astype(x: &Value, dtype: DType) -> Result<Value> {
    if x.dtype() == dtype {
        return Ok(x.clone());
    }
    bind1(
        "convert",
        vec![x.clone()],
        Params::new().with("dtype", ParamValue::DType(dtype)),
    )
}

/// Sum over the given axes; `None` sums over all axes, `[]` is the
/// identity.
pub fn sum(x: &Value, axes: Option<&[usize]>) -> Result<Value> {
    let rank = x.rank();
    let mut axes: Vec<usize> = match axes {
        None => (0..rank).collect(),
        Some(a) => a.to_vec(),
    };
    axes.sort_unstable();
    axes.dedup();
    if let Some(bad) = axes.iter().find(|a| **a >= rank) {
        return Err(TraceError::ShapeMismatch(format!(
            "reduce axis {bad} out of range for rank {rank}"
        )));
    }
    bind1(
        "reduce_sum",
        vec![x.clone()],
        Params::new().with("axes", ParamValue::Axes(axes)),
    )
}

/// Broadcast to `shape`, inserting new axes at the positions in `axes`.
pub fn broadcast(x: &Value, shape: &[usize], axes: &[usize]) -> Result<Value> {
    bind1(
        "broadcast",
        vec![x.clone()],
        Params::new()
            .with("shape", ParamValue::Shape(shape.to_vec()))
            .with("axes", ParamValue::Axes(axes.to_vec())),
    )
}

/// Permute axes; `None` reverses them.
pub fn transpose(x: &Value, perm: Option<&[usize]>) -> Result<Value> {
    let perm: Vec<usize> = match perm {
        None => (0..x.rank()).rev().collect(),
        Some(p) => p.to_vec(),
    };
    bind1(
        "transpose",
        vec![x.clone()],
        Params::new().with("perm", ParamValue::Axes(perm)),
    )
}

/// Reinterpret the data with a new shape of the same total size.
pub fn reshape(x: &Value, shape: &[usize]) -> Result<Value> {
    bind1(
        "reshape",
        vec![x.clone()],
        Params::new().with("shape", ParamValue::Shape(shape.to_vec())),
    )
}

/// Matrix product with numpy rank rules: vectors contract, matrices
/// multiply, one stacked leading dimension broadcasts.
pub fn matmul(x: &Value, y: &Value) -> Result<Value> {
    bind1("matmul", vec![x.clone(), y.clone()], Params::new())
}
