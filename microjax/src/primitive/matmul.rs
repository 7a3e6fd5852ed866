//! Rules for `matmul`.
//!
//! Rank rules follow numpy: vectors contract, matrices multiply, and one
//! stacked leading dimension broadcasts (extent 1 expands). Higher stacks
//! are out of range and rejected at abstract evaluation.

use super::{unbroadcast, Params, Primitive, TransposeArg};
use crate::aval::ShapedArray;
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use crate::np;
use crate::trace::batch::move_batch_axis;
use crate::trace::Value;

pub(super) fn register_all() {
    super::register_primitive(Primitive {
        name: "matmul",
        abstract_eval: matmul_abstract,
        jvp: Some(matmul_jvp),
        transpose: Some(matmul_transpose),
        batch: Some(matmul_batch),
        linear_inputs: &[0, 1],
    });
}

fn bad_shapes(x: &ShapedArray, y: &ShapedArray) -> TraceError {
    TraceError::ShapeMismatch(format!("matmul of {x} with {y}"))
}

fn matmul_abstract(ins: &[ShapedArray], _params: &Params) -> Result<Vec<ShapedArray>> {
    if ins.len() != 2 {
        return Err(TraceError::ShapeMismatch(format!(
            "matmul expects 2 inputs, got {}",
            ins.len()
        )));
    }
    let (x, y) = (&ins[0], &ins[1]);
    for a in ins {
        if a.dtype == DType::Bool {
            return Err(TraceError::DTypeMismatch("matmul of bool arrays".into()));
        }
    }
    let dtype = DType::promote(x.dtype, y.dtype);
    let shape = match (x.rank(), y.rank()) {
        (1, 1) if x.shape[0] == y.shape[0] => vec![],
        (1, 2) if x.shape[0] == y.shape[0] => vec![y.shape[1]],
        (2, 1) if x.shape[1] == y.shape[0] => vec![x.shape[0]],
        (2, 2) if x.shape[1] == y.shape[0] => vec![x.shape[0], y.shape[1]],
        (3, 1) if x.shape[2] == y.shape[0] => vec![x.shape[0], x.shape[1]],
        (1, 3) if x.shape[0] == y.shape[1] => vec![y.shape[0], y.shape[2]],
        (3, 2) if x.shape[2] == y.shape[0] => {
            vec![x.shape[0], x.shape[1], y.shape[1]]
        }
        (2, 3) if x.shape[1] == y.shape[1] => {
            vec![y.shape[0], x.shape[0], y.shape[2]]
        }
        (3, 3) if x.shape[2] == y.shape[1] => {
            let (bx, by) = (x.shape[0], y.shape[0]);
            let b = if bx == by || by == 1 {
                bx
            } else if bx == 1 {
                by
            } else {
                return Err(bad_shapes(x, y));
            };
            vec![b, x.shape[1], y.shape[2]]
        }
        _ => return Err(bad_shapes(x, y)),
    };
    Ok(vec![ShapedArray::new(shape, dtype)])
}

fn matmul_jvp(p: &[Value], t: &[Value], _params: &Params) -> Result<(Vec<Value>, Vec<Value>)> {
    let primal = np::matmul(&p[0], &p[1])?;
    let tangent = np::add(
        &np::matmul(&t[0], &p[1])?,
        &np::matmul(&p[0], &t[1])?,
    )?;
    Ok((vec![primal], vec![tangent]))
}

/// Swap the last two axes of a rank >= 2 value.
fn swap_last(v: &Value) -> Result<Value> {
    let rank = v.rank();
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(rank - 2, rank - 1);
    np::transpose(v, Some(&perm))
}

fn matmul_transpose(
    cts: &[Value],
    args: &[TransposeArg],
    _params: &Params,
) -> Result<Vec<Option<Value>>> {
    let ct = &cts[0];
    let (xa, ya) = (args[0].aval(), args[1].aval());
    let missing = || TraceError::MissingRule {
        primitive: "matmul".into(),
        transform: "transpose",
    };

    let ct_x = if args[0].is_linear() {
        let y = args[1].known().ok_or_else(missing)?;
        let raw = match (xa.rank(), ya.rank()) {
            (1, 1) => np::mul(ct, y)?,
            (1, 2) => np::matmul(y, ct)?,
            (2, 1) => np::matmul(
                &np::reshape(ct, &[xa.shape[0], 1])?,
                &np::reshape(y, &[1, ya.shape[0]])?,
            )?,
            (3, 1) => {
                let b = ct.shape()[0];
                let m = ct.shape()[1];
                np::matmul(
                    &np::reshape(ct, &[b, m, 1])?,
                    &np::reshape(y, &[1, ya.shape[0]])?,
                )?
            }
            (1, 3) => {
                let b = y.shape()[0];
                let n = y.shape()[2];
                let t = np::matmul(y, &np::reshape(ct, &[b, n, 1])?)?;
                np::reshape(&t, &[b, ya.shape[1]])?
            }
            _ => np::matmul(ct, &swap_last(y)?)?,
        };
        Some(unbroadcast(&raw, &xa)?)
    } else {
        None
    };

    let ct_y = if args[1].is_linear() {
        let x = args[0].known().ok_or_else(missing)?;
        let raw = match (xa.rank(), ya.rank()) {
            (1, 1) => np::mul(ct, x)?,
            (2, 1) => np::matmul(&swap_last(x)?, ct)?,
            (1, 2) => np::matmul(
                &np::reshape(x, &[xa.shape[0], 1])?,
                &np::reshape(ct, &[1, ya.shape[1]])?,
            )?,
            (1, 3) => {
                let b = ya.shape[0];
                np::matmul(
                    &np::reshape(x, &[xa.shape[0], 1])?,
                    &np::reshape(ct, &[b, 1, ya.shape[2]])?,
                )?
            }
            (3, 1) => {
                let b = x.shape()[0];
                let t = np::matmul(&swap_last(x)?, &np::reshape(ct, &[b, xa.shape[1], 1])?)?;
                np::reshape(&t, &[b, ya.shape[0]])?
            }
            _ => np::matmul(&swap_last(x)?, ct)?,
        };
        Some(unbroadcast(&raw, &ya)?)
    } else {
        None
    };

    Ok(vec![ct_x, ct_y])
}

fn matmul_batch(
    vals: &[Value],
    dims: &[Option<usize>],
    axis_size: usize,
    _params: &Params,
) -> Result<(Vec<Value>, Vec<Option<usize>>)> {
    let logical_rank = |v: &Value, d: Option<usize>| v.rank() - usize::from(d.is_some());
    let (lx, ly) = (
        logical_rank(&vals[0], dims[0]),
        logical_rank(&vals[1], dims[1]),
    );
    if lx > 2 || ly > 2 {
        return Err(TraceError::ShapeMismatch(
            "vmap over an already stacked matmul is not supported".into(),
        ));
    }
    let x = match dims[0] {
        None => vals[0].clone(),
        Some(d) => move_batch_axis(axis_size, Some(d), 0, &vals[0])?,
    };
    let y = match dims[1] {
        None => vals[1].clone(),
        Some(d) => move_batch_axis(axis_size, Some(d), 0, &vals[1])?,
    };
    let (xb, yb) = (dims[0].is_some(), dims[1].is_some());

    let out = match (lx, ly, xb, yb) {
        // Matrix-matrix: the stacked-rank rules do the work.
        (2, 2, _, _) => np::matmul(&x, &y)?,
        // Vector-matrix.
        (1, 2, true, false) => np::matmul(&x, &y)?,
        (1, 2, false, true) => np::matmul(&x, &y)?,
        (1, 2, true, true) => {
            let k = x.shape()[1];
            let t = np::matmul(&np::reshape(&x, &[axis_size, 1, k])?, &y)?;
            let n = t.shape()[2];
            np::reshape(&t, &[axis_size, n])?
        }
        // Matrix-vector.
        (2, 1, true, false) => np::matmul(&x, &y)?,
        (2, 1, false, true) => np::matmul(&y, &swap_last(&x)?)?,
        (2, 1, true, true) => {
            let k = y.shape()[1];
            let t = np::matmul(&x, &np::reshape(&y, &[axis_size, k, 1])?)?;
            let m = t.shape()[1];
            np::reshape(&t, &[axis_size, m])?
        }
        // Vector-vector dot products.
        (1, 1, true, false) | (1, 1, false, true) => {
            let (a, b) = if xb { (&x, &y) } else { (&y, &x) };
            np::matmul(a, b)?
        }
        (1, 1, true, true) => np::sum(&np::mul(&x, &y)?, Some(&[1]))?,
        _ => {
            return Err(TraceError::ShapeMismatch(
                "matmul batching requires at least one batched operand".into(),
            ))
        }
    };
    Ok((vec![out], vec![Some(0)]))
}
