//! The batching trace: `vmap`'s interpreter.
//!
//! A batching tracer carries the full batched value plus the physical axis
//! holding the implicit batch dimension (`None` for values shared across
//! the batch). Tracer avals are logical, with the batch axis removed, so
//! rank-dependent surface logic (axis defaults, shape checks) sees the
//! per-element view.

use crate::aval::Aval;
use crate::error::{Result, TraceError};
use crate::np;
use crate::primitive::{Params, Primitive};
use crate::trace::{push_trace, MainTrace, TraceKind, TracePayload, TracerPayload, Value};
use std::rc::Rc;

pub(crate) fn process(
    top: &Rc<MainTrace>,
    prim: &Primitive,
    args: &[Value],
    params: &Params,
) -> Result<Vec<Value>> {
    let axis_size = match top.payload {
        TracePayload::Batch { axis_size } => axis_size,
        _ => {
            return Err(TraceError::LevelViolation(
                "batch trace lost its axis size".into(),
            ))
        }
    };
    let rule = prim.batch.ok_or_else(|| TraceError::MissingRule {
        primitive: prim.name.to_string(),
        transform: "batch",
    })?;

    let mut vals = Vec::with_capacity(args.len());
    let mut dims = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Tracer(t) if Rc::ptr_eq(&t.trace, top) => match &t.payload {
                TracerPayload::Batch { val, bdim } => {
                    vals.push(val.clone());
                    dims.push(*bdim);
                }
                other => {
                    return Err(TraceError::LevelViolation(format!(
                        "batch trace received a foreign tracer payload {other:?}"
                    )))
                }
            },
            _ => {
                return Err(TraceError::LevelViolation(
                    "batch trace received an unlifted value".into(),
                ))
            }
        }
    }

    let (out_vals, out_dims) = rule(&vals, &dims, axis_size, params)?;
    if out_vals.len() != out_dims.len() {
        return Err(TraceError::Backend(format!(
            "batch rule for '{}' returned {} values and {} dims",
            prim.name,
            out_vals.len(),
            out_dims.len()
        )));
    }
    Ok(out_vals
        .into_iter()
        .zip(out_dims)
        .map(|(val, bdim)| wrap(top, val, bdim))
        .collect())
}

fn wrap(top: &Rc<MainTrace>, val: Value, bdim: Option<usize>) -> Value {
    let mut shape = val.shape();
    if let Some(d) = bdim {
        shape.remove(d);
    }
    let aval = Aval::Shaped(crate::aval::ShapedArray::new(shape, val.dtype()));
    Value::tracer(top.clone(), aval, TracerPayload::Batch { val, bdim })
}

/// Move (or materialise) the batch axis of `x` to position `dst`.
pub(crate) fn move_batch_axis(
    axis_size: usize,
    src: Option<usize>,
    dst: usize,
    x: &Value,
) -> Result<Value> {
    match src {
        None => {
            // Unbatched: insert the axis by broadcasting.
            let mut shape = x.shape();
            shape.insert(dst, axis_size);
            np::broadcast(x, &shape, &[dst])
        }
        Some(s) if s == dst => Ok(x.clone()),
        Some(s) => {
            let rank = x.rank();
            let mut perm: Vec<usize> = (0..rank).filter(|d| *d != s).collect();
            perm.insert(dst, s);
            np::transpose(x, Some(&perm))
        }
    }
}

/// Run `f` under a fresh batching trace, returning outputs with their raw
/// batch dims. Used by `vmap` and by the batching rule of `jit`.
pub(crate) fn batch_raw(
    f: &dyn Fn(&[Value]) -> Result<Vec<Value>>,
    vals: &[Value],
    dims: &[Option<usize>],
    axis_size: usize,
) -> Result<(Vec<Value>, Vec<Option<usize>>)> {
    let guard = push_trace(TraceKind::Batch, TracePayload::Batch { axis_size });
    let trace = guard.trace();
    let ins: Vec<Value> = vals
        .iter()
        .zip(dims)
        .map(|(v, d)| wrap(&trace, v.clone(), *d))
        .collect();
    let outs = f(&ins)?;

    let mut out_vals = Vec::with_capacity(outs.len());
    let mut out_dims = Vec::with_capacity(outs.len());
    for out in outs {
        match &out {
            Value::Tracer(t) if Rc::ptr_eq(&t.trace, &trace) => match &t.payload {
                TracerPayload::Batch { val, bdim } => {
                    out_vals.push(val.clone());
                    out_dims.push(*bdim);
                }
                _ => {
                    return Err(TraceError::LevelViolation(
                        "batch trace produced a foreign tracer".into(),
                    ))
                }
            },
            _ => {
                out_vals.push(out);
                out_dims.push(None);
            }
        }
    }
    drop(guard);
    Ok((out_vals, out_dims))
}
