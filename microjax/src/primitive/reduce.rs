//! Rules for reductions.
//!
//! `reduce_sum` carries an explicit sorted `axes` parameter; the surface
//! wrapper resolves `None` ("all axes") before binding, and an empty list
//! is the identity.

use super::{Params, Primitive, TransposeArg};
use crate::aval::ShapedArray;
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use crate::np;
use crate::trace::Value;

pub(super) fn register_all() {
    super::register_primitive(Primitive {
        name: "reduce_sum",
        abstract_eval: reduce_sum_abstract,
        jvp: Some(reduce_sum_jvp),
        transpose: Some(reduce_sum_transpose),
        batch: Some(reduce_sum_batch),
        linear_inputs: &[0],
    });
}

/// The shape left after removing `axes` from `shape`.
pub(crate) fn reduced_shape(shape: &[usize], axes: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, d)| (!axes.contains(&i)).then_some(*d))
        .collect()
}

fn reduce_sum_abstract(ins: &[ShapedArray], params: &Params) -> Result<Vec<ShapedArray>> {
    if ins.len() != 1 {
        return Err(TraceError::ShapeMismatch(format!(
            "reduce_sum expects 1 input, got {}",
            ins.len()
        )));
    }
    if ins[0].dtype == DType::Bool {
        return Err(TraceError::DTypeMismatch("sum of a bool array".into()));
    }
    let axes = params.axes("axes")?;
    let mut seen = vec![false; ins[0].rank()];
    for a in axes {
        if *a >= ins[0].rank() || seen[*a] {
            return Err(TraceError::ShapeMismatch(format!(
                "bad reduce axis {a} for shape {:?}",
                ins[0].shape
            )));
        }
        seen[*a] = true;
    }
    Ok(vec![ShapedArray::new(
        reduced_shape(&ins[0].shape, axes),
        ins[0].dtype,
    )])
}

fn reduce_sum_jvp(
    p: &[Value],
    t: &[Value],
    params: &Params,
) -> Result<(Vec<Value>, Vec<Value>)> {
    let axes = params.axes("axes")?;
    Ok((
        vec![np::sum(&p[0], Some(axes))?],
        vec![np::sum(&t[0], Some(axes))?],
    ))
}

fn reduce_sum_transpose(
    cts: &[Value],
    args: &[TransposeArg],
    params: &Params,
) -> Result<Vec<Option<Value>>> {
    // The adjoint of summing axes away is broadcasting them back in.
    let aval = args[0].aval();
    let axes = params.axes("axes")?;
    Ok(vec![Some(np::broadcast(&cts[0], &aval.shape, axes)?)])
}

fn reduce_sum_batch(
    vals: &[Value],
    dims: &[Option<usize>],
    _axis_size: usize,
    params: &Params,
) -> Result<(Vec<Value>, Vec<Option<usize>>)> {
    let axes = params.axes("axes")?;
    match dims[0] {
        None => Ok((vec![np::sum(&vals[0], Some(axes))?], vec![None])),
        Some(bdim) => {
            // Shift logical axes past the physical batch axis.
            let shifted: Vec<usize> = axes
                .iter()
                .map(|a| if *a >= bdim { *a + 1 } else { *a })
                .collect();
            let out_bdim = bdim - shifted.iter().filter(|a| **a < bdim).count();
            Ok((
                vec![np::sum(&vals[0], Some(&shifted))?],
                vec![Some(out_bdim)],
            ))
        }
    }
}
