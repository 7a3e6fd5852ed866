//! Rules for the elementwise primitives.
//!
//! Binary arithmetic broadcasts trailing-aligned and promotes dtypes on the
//! lattice. Comparisons produce `bool` and carry zero-tangent jvp rules;
//! they have no transpose rule and are skipped during transposition.

use super::{unbroadcast, Params, Primitive, TransposeArg};
use crate::aval::{broadcast_shapes, ShapedArray};
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use crate::np;
use crate::trace::{zeros_like, Value};

pub(super) fn register_all() {
    super::register_primitive(Primitive {
        name: "add",
        abstract_eval: arith_binop_abstract,
        jvp: Some(add_jvp),
        transpose: Some(add_transpose),
        batch: Some(add_batch),
        linear_inputs: &[0, 1],
    });
    super::register_primitive(Primitive {
        name: "sub",
        abstract_eval: arith_binop_abstract,
        jvp: Some(sub_jvp),
        transpose: Some(sub_transpose),
        batch: Some(sub_batch),
        linear_inputs: &[0, 1],
    });
    super::register_primitive(Primitive {
        name: "mul",
        abstract_eval: arith_binop_abstract,
        jvp: Some(mul_jvp),
        transpose: Some(mul_transpose),
        batch: Some(mul_batch),
        linear_inputs: &[0, 1],
    });
    super::register_primitive(Primitive {
        name: "div",
        abstract_eval: arith_binop_abstract,
        jvp: Some(div_jvp),
        transpose: Some(div_transpose),
        batch: Some(div_batch),
        linear_inputs: &[0],
    });
    super::register_primitive(Primitive {
        name: "neg",
        abstract_eval: neg_abstract,
        jvp: Some(neg_jvp),
        transpose: Some(neg_transpose),
        batch: Some(neg_batch),
        linear_inputs: &[0],
    });
    super::register_primitive(Primitive {
        name: "sin",
        abstract_eval: float_unary_abstract,
        jvp: Some(sin_jvp),
        transpose: None,
        batch: Some(sin_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "cos",
        abstract_eval: float_unary_abstract,
        jvp: Some(cos_jvp),
        transpose: None,
        batch: Some(cos_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "exp",
        abstract_eval: float_unary_abstract,
        jvp: Some(exp_jvp),
        transpose: None,
        batch: Some(exp_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "log",
        abstract_eval: float_unary_abstract,
        jvp: Some(log_jvp),
        transpose: None,
        batch: Some(log_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "sqrt",
        abstract_eval: float_unary_abstract,
        jvp: Some(sqrt_jvp),
        transpose: None,
        batch: Some(sqrt_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "greater",
        abstract_eval: ordered_cmp_abstract,
        jvp: Some(greater_jvp),
        transpose: None,
        batch: Some(greater_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "less",
        abstract_eval: ordered_cmp_abstract,
        jvp: Some(less_jvp),
        transpose: None,
        batch: Some(less_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "equal",
        abstract_eval: equal_abstract,
        jvp: Some(equal_jvp),
        transpose: None,
        batch: Some(equal_batch),
        linear_inputs: &[],
    });
    super::register_primitive(Primitive {
        name: "convert",
        abstract_eval: convert_abstract,
        jvp: Some(convert_jvp),
        transpose: Some(convert_transpose),
        batch: Some(convert_batch),
        linear_inputs: &[0],
    });
}

// ---------------------------------------------------------------------------
// Abstract evaluation
// ---------------------------------------------------------------------------

fn expect_arity(ins: &[ShapedArray], n: usize) -> Result<()> {
    if ins.len() != n {
        return Err(TraceError::ShapeMismatch(format!(
            "expected {n} inputs, got {}",
            ins.len()
        )));
    }
    Ok(())
}

fn arith_binop_abstract(ins: &[ShapedArray], _params: &Params) -> Result<Vec<ShapedArray>> {
    expect_arity(ins, 2)?;
    for a in ins {
        if a.dtype == DType::Bool {
            return Err(TraceError::DTypeMismatch(
                "arithmetic on bool arrays".into(),
            ));
        }
    }
    let shape = broadcast_shapes(&ins[0].shape, &ins[1].shape)?;
    let dtype = DType::promote(ins[0].dtype, ins[1].dtype);
    Ok(vec![ShapedArray::new(shape, dtype)])
}

fn neg_abstract(ins: &[ShapedArray], _params: &Params) -> Result<Vec<ShapedArray>> {
    expect_arity(ins, 1)?;
    if ins[0].dtype == DType::Bool {
        return Err(TraceError::DTypeMismatch("negation of a bool array".into()));
    }
    Ok(vec![ins[0].clone()])
}

fn float_unary_abstract(ins: &[ShapedArray], _params: &Params) -> Result<Vec<ShapedArray>> {
    expect_arity(ins, 1)?;
    if !ins[0].dtype.is_inexact() {
        return Err(TraceError::DTypeMismatch(format!(
            "transcendental applied to {} array",
            ins[0].dtype
        )));
    }
    Ok(vec![ins[0].clone()])
}

fn ordered_cmp_abstract(ins: &[ShapedArray], _params: &Params) -> Result<Vec<ShapedArray>> {
    expect_arity(ins, 2)?;
    for a in ins {
        if a.dtype.is_complex() {
            return Err(TraceError::DTypeMismatch(
                "ordered comparison of complex arrays".into(),
            ));
        }
    }
    let shape = broadcast_shapes(&ins[0].shape, &ins[1].shape)?;
    Ok(vec![ShapedArray::new(shape, DType::Bool)])
}

fn equal_abstract(ins: &[ShapedArray], _params: &Params) -> Result<Vec<ShapedArray>> {
    expect_arity(ins, 2)?;
    let shape = broadcast_shapes(&ins[0].shape, &ins[1].shape)?;
    Ok(vec![ShapedArray::new(shape, DType::Bool)])
}

fn convert_abstract(ins: &[ShapedArray], params: &Params) -> Result<Vec<ShapedArray>> {
    expect_arity(ins, 1)?;
    let dtype = params.dtype("dtype")?;
    if ins[0].dtype.is_complex() && !dtype.is_complex() {
        return Err(TraceError::DTypeMismatch(format!(
            "cannot convert {} to {}",
            ins[0].dtype, dtype
        )));
    }
    Ok(vec![ShapedArray::new(ins[0].shape.clone(), dtype)])
}

// ---------------------------------------------------------------------------
// JVP
// ---------------------------------------------------------------------------

type JvpOut = Result<(Vec<Value>, Vec<Value>)>;

fn add_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    Ok((
        vec![np::add(&p[0], &p[1])?],
        vec![np::add(&t[0], &t[1])?],
    ))
}

fn sub_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    Ok((
        vec![np::sub(&p[0], &p[1])?],
        vec![np::sub(&t[0], &t[1])?],
    ))
}

fn mul_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    let primal = np::mul(&p[0], &p[1])?;
    let tangent = np::add(&np::mul(&t[0], &p[1])?, &np::mul(&p[0], &t[1])?)?;
    Ok((vec![primal], vec![tangent]))
}

fn div_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    // d(x/y) = dx/y - x*dy/y^2
    let primal = np::div(&p[0], &p[1])?;
    let lhs = np::div(&t[0], &p[1])?;
    let rhs = np::div(&np::mul(&p[0], &t[1])?, &np::mul(&p[1], &p[1])?)?;
    Ok((vec![primal], vec![np::sub(&lhs, &rhs)?]))
}

fn neg_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    Ok((vec![np::neg(&p[0])?], vec![np::neg(&t[0])?]))
}

fn sin_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    let primal = np::sin(&p[0])?;
    let tangent = np::mul(&t[0], &np::cos(&p[0])?)?;
    Ok((vec![primal], vec![tangent]))
}

fn cos_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    let primal = np::cos(&p[0])?;
    let tangent = np::neg(&np::mul(&t[0], &np::sin(&p[0])?)?)?;
    Ok((vec![primal], vec![tangent]))
}

fn exp_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    let primal = np::exp(&p[0])?;
    let tangent = np::mul(&t[0], &primal)?;
    Ok((vec![primal], vec![tangent]))
}

fn log_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    let primal = np::log(&p[0])?;
    let tangent = np::div(&t[0], &p[0])?;
    Ok((vec![primal], vec![tangent]))
}

fn sqrt_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    let primal = np::sqrt(&p[0])?;
    let two = np::scalar(2.0, primal.dtype());
    let tangent = np::div(&t[0], &np::mul(&two, &primal)?)?;
    Ok((vec![primal], vec![tangent]))
}

fn greater_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    zero_tangent_cmp(np::greater(&p[0], &p[1])?, t)
}

fn less_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    zero_tangent_cmp(np::less(&p[0], &p[1])?, t)
}

fn equal_jvp(p: &[Value], t: &[Value], _params: &Params) -> JvpOut {
    zero_tangent_cmp(np::equal(&p[0], &p[1])?, t)
}

/// Comparisons are non-differentiable: the tangent is zero and keeps the
/// output dtype, so sparsity-aware consumers can still propagate it.
fn zero_tangent_cmp(primal: Value, _tangents: &[Value]) -> JvpOut {
    let tangent = zeros_like(&primal);
    Ok((vec![primal], vec![tangent]))
}

fn convert_jvp(p: &[Value], t: &[Value], params: &Params) -> JvpOut {
    let dtype = params.dtype("dtype")?;
    let primal = np::astype(&p[0], dtype)?;
    let tangent = if dtype.is_inexact() {
        np::astype(&t[0], dtype)?
    } else {
        zeros_like(&primal)
    };
    Ok((vec![primal], vec![tangent]))
}

// ---------------------------------------------------------------------------
// Transposition
// ---------------------------------------------------------------------------

type TransposeOut = Result<Vec<Option<Value>>>;

fn add_transpose(cts: &[Value], args: &[TransposeArg], _params: &Params) -> TransposeOut {
    let ct = &cts[0];
    args.iter()
        .map(|arg| {
            arg.is_linear()
                .then(|| unbroadcast(ct, &arg.aval()))
                .transpose()
        })
        .collect()
}

fn sub_transpose(cts: &[Value], args: &[TransposeArg], _params: &Params) -> TransposeOut {
    let ct = &cts[0];
    let lhs = args[0]
        .is_linear()
        .then(|| unbroadcast(ct, &args[0].aval()))
        .transpose()?;
    let rhs = args[1]
        .is_linear()
        .then(|| unbroadcast(&np::neg(ct)?, &args[1].aval()))
        .transpose()?;
    Ok(vec![lhs, rhs])
}

fn neg_transpose(cts: &[Value], _args: &[TransposeArg], _params: &Params) -> TransposeOut {
    Ok(vec![Some(np::neg(&cts[0])?)])
}

fn mul_transpose(cts: &[Value], args: &[TransposeArg], _params: &Params) -> TransposeOut {
    let ct = &cts[0];
    match (args[0].known(), args[1].known()) {
        (None, Some(y)) => Ok(vec![
            Some(unbroadcast(&np::mul(ct, y)?, &args[0].aval())?),
            None,
        ]),
        (Some(x), None) => Ok(vec![
            None,
            Some(unbroadcast(&np::mul(x, ct)?, &args[1].aval())?),
        ]),
        _ => Err(TraceError::MissingRule {
            primitive: "mul".into(),
            transform: "transpose",
        }),
    }
}

fn div_transpose(cts: &[Value], args: &[TransposeArg], _params: &Params) -> TransposeOut {
    // Only the numerator is linear.
    match (args[0].is_linear(), args[1].known()) {
        (true, Some(y)) => Ok(vec![
            Some(unbroadcast(&np::div(&cts[0], y)?, &args[0].aval())?),
            None,
        ]),
        _ => Err(TraceError::MissingRule {
            primitive: "div".into(),
            transform: "transpose",
        }),
    }
}

fn convert_transpose(cts: &[Value], args: &[TransposeArg], _params: &Params) -> TransposeOut {
    Ok(vec![Some(np::astype(&cts[0], args[0].aval().dtype)?)])
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

type BatchOut = Result<(Vec<Value>, Vec<Option<usize>>)>;

fn add_batch(v: &[Value], d: &[Option<usize>], n: usize, _p: &Params) -> BatchOut {
    batch_binary(np::add, v, d, n)
}

fn sub_batch(v: &[Value], d: &[Option<usize>], n: usize, _p: &Params) -> BatchOut {
    batch_binary(np::sub, v, d, n)
}

fn mul_batch(v: &[Value], d: &[Option<usize>], n: usize, _p: &Params) -> BatchOut {
    batch_binary(np::mul, v, d, n)
}

fn div_batch(v: &[Value], d: &[Option<usize>], n: usize, _p: &Params) -> BatchOut {
    batch_binary(np::div, v, d, n)
}

fn greater_batch(v: &[Value], d: &[Option<usize>], n: usize, _p: &Params) -> BatchOut {
    batch_binary(np::greater, v, d, n)
}

fn less_batch(v: &[Value], d: &[Option<usize>], n: usize, _p: &Params) -> BatchOut {
    batch_binary(np::less, v, d, n)
}

fn equal_batch(v: &[Value], d: &[Option<usize>], n: usize, _p: &Params) -> BatchOut {
    batch_binary(np::equal, v, d, n)
}

fn neg_batch(v: &[Value], d: &[Option<usize>], _n: usize, _p: &Params) -> BatchOut {
    Ok((vec![np::neg(&v[0])?], vec![d[0]]))
}

fn sin_batch(v: &[Value], d: &[Option<usize>], _n: usize, _p: &Params) -> BatchOut {
    Ok((vec![np::sin(&v[0])?], vec![d[0]]))
}

fn cos_batch(v: &[Value], d: &[Option<usize>], _n: usize, _p: &Params) -> BatchOut {
    Ok((vec![np::cos(&v[0])?], vec![d[0]]))
}

fn exp_batch(v: &[Value], d: &[Option<usize>], _n: usize, _p: &Params) -> BatchOut {
    Ok((vec![np::exp(&v[0])?], vec![d[0]]))
}

fn log_batch(v: &[Value], d: &[Option<usize>], _n: usize, _p: &Params) -> BatchOut {
    Ok((vec![np::log(&v[0])?], vec![d[0]]))
}

fn sqrt_batch(v: &[Value], d: &[Option<usize>], _n: usize, _p: &Params) -> BatchOut {
    Ok((vec![np::sqrt(&v[0])?], vec![d[0]]))
}

fn convert_batch(v: &[Value], d: &[Option<usize>], _n: usize, p: &Params) -> BatchOut {
    Ok((vec![np::astype(&v[0], p.dtype("dtype")?)?], vec![d[0]]))
}

/// Shared batching for implicitly broadcasting binary primitives: batched
/// operands move their batch axis to the front and left-pad their logical
/// dims with 1s, so trailing-aligned broadcasting lines the batch and
/// logical axes up; unbatched operands are left alone.
fn batch_binary(
    op: fn(&Value, &Value) -> Result<Value>,
    vals: &[Value],
    dims: &[Option<usize>],
    axis_size: usize,
) -> BatchOut {
    let logical = |v: &Value, d: Option<usize>| -> Vec<usize> {
        let mut s = v.shape();
        if let Some(d) = d {
            s.remove(d);
        }
        s
    };
    let lx = logical(&vals[0], dims[0]);
    let ly = logical(&vals[1], dims[1]);
    let out_rank = broadcast_shapes(&lx, &ly)?.len();

    let mut aligned = Vec::with_capacity(2);
    for (v, d) in vals.iter().zip(dims) {
        match d {
            None => aligned.push(v.clone()),
            Some(src) => {
                let v = crate::trace::batch::move_batch_axis(axis_size, Some(*src), 0, v)?;
                let logical_shape = logical(&v, Some(0));
                let mut padded = vec![axis_size];
                padded.extend(std::iter::repeat(1).take(out_rank - logical_shape.len()));
                padded.extend(&logical_shape);
                aligned.push(if padded.len() == v.rank() {
                    v
                } else {
                    np::reshape(&v, &padded)?
                });
            }
        }
    }
    let out = op(&aligned[0], &aligned[1])?;
    let out_dim = dims.iter().any(Option::is_some).then_some(0);
    Ok((vec![out], vec![out_dim]))
}
