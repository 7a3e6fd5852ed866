//! Rules for the structural primitives: `broadcast`, `transpose`,
//! `reshape`. All three are linear, so their transpose rules are the
//! structural inverses.

use super::{unbroadcast, Params, Primitive, TransposeArg};
use crate::aval::ShapedArray;
use crate::error::{Result, TraceError};
use crate::np;
use crate::trace::batch::move_batch_axis;
use crate::trace::Value;

pub(super) fn register_all() {
    super::register_primitive(Primitive {
        name: "broadcast",
        abstract_eval: broadcast_abstract,
        jvp: Some(broadcast_jvp),
        transpose: Some(broadcast_transpose),
        batch: Some(broadcast_batch),
        linear_inputs: &[0],
    });
    super::register_primitive(Primitive {
        name: "transpose",
        abstract_eval: transpose_abstract,
        jvp: Some(transpose_jvp),
        transpose: Some(transpose_transpose),
        batch: Some(transpose_batch),
        linear_inputs: &[0],
    });
    super::register_primitive(Primitive {
        name: "reshape",
        abstract_eval: reshape_abstract,
        jvp: Some(reshape_jvp),
        transpose: Some(reshape_transpose),
        batch: Some(reshape_batch),
        linear_inputs: &[0],
    });
}

// ---------------------------------------------------------------------------
// broadcast{shape, axes}
// ---------------------------------------------------------------------------

fn broadcast_abstract(ins: &[ShapedArray], params: &Params) -> Result<Vec<ShapedArray>> {
    let shape = params.shape("shape")?;
    let axes = params.axes("axes")?;
    let x = &ins[0];
    if axes.windows(2).any(|w| w[0] >= w[1]) {
        return Err(TraceError::ShapeMismatch(format!(
            "broadcast axes {axes:?} must be strictly increasing"
        )));
    }
    if axes.iter().any(|a| *a >= shape.len()) {
        return Err(TraceError::ShapeMismatch(format!(
            "broadcast axes {axes:?} out of range for shape {shape:?}"
        )));
    }
    if shape.len() != x.rank() + axes.len() {
        return Err(TraceError::ShapeMismatch(format!(
            "broadcast of {} to {shape:?} inserting {axes:?}",
            x
        )));
    }
    let kept: Vec<usize> = (0..shape.len()).filter(|d| !axes.contains(d)).collect();
    for (xd, outd) in x.shape.iter().zip(kept.iter().map(|d| shape[*d])) {
        if *xd != outd && *xd != 1 {
            return Err(TraceError::ShapeMismatch(format!(
                "cannot broadcast {} to {shape:?} inserting {axes:?}",
                x
            )));
        }
    }
    Ok(vec![ShapedArray::new(shape.to_vec(), x.dtype)])
}

fn broadcast_jvp(p: &[Value], t: &[Value], params: &Params) -> Result<(Vec<Value>, Vec<Value>)> {
    let shape = params.shape("shape")?;
    let axes = params.axes("axes")?;
    Ok((
        vec![np::broadcast(&p[0], shape, axes)?],
        vec![np::broadcast(&t[0], shape, axes)?],
    ))
}

fn broadcast_transpose(
    cts: &[Value],
    args: &[TransposeArg],
    params: &Params,
) -> Result<Vec<Option<Value>>> {
    let axes = params.axes("axes")?;
    // Sum the inserted axes away, then fold any extent-1 expansions.
    let summed = np::sum(&cts[0], Some(axes))?;
    Ok(vec![Some(unbroadcast(&summed, &args[0].aval())?)])
}

fn broadcast_batch(
    vals: &[Value],
    dims: &[Option<usize>],
    axis_size: usize,
    params: &Params,
) -> Result<(Vec<Value>, Vec<Option<usize>>)> {
    let shape = params.shape("shape")?;
    let axes = params.axes("axes")?;
    let x = move_batch_axis(axis_size, dims[0], 0, &vals[0])?;
    let mut out_shape = vec![axis_size];
    out_shape.extend_from_slice(shape);
    let out_axes: Vec<usize> = axes.iter().map(|a| a + 1).collect();
    Ok((
        vec![np::broadcast(&x, &out_shape, &out_axes)?],
        vec![Some(0)],
    ))
}

// ---------------------------------------------------------------------------
// transpose{perm}
// ---------------------------------------------------------------------------

fn transpose_abstract(ins: &[ShapedArray], params: &Params) -> Result<Vec<ShapedArray>> {
    let perm = params.axes("perm")?;
    let x = &ins[0];
    let mut seen = vec![false; x.rank()];
    if perm.len() != x.rank() || perm.iter().any(|p| *p >= x.rank() || std::mem::replace(&mut seen[*p], true)) {
        return Err(TraceError::ShapeMismatch(format!(
            "{perm:?} is not a permutation of the axes of {x}"
        )));
    }
    let shape: Vec<usize> = perm.iter().map(|p| x.shape[*p]).collect();
    Ok(vec![ShapedArray::new(shape, x.dtype)])
}

fn transpose_jvp(p: &[Value], t: &[Value], params: &Params) -> Result<(Vec<Value>, Vec<Value>)> {
    let perm = params.axes("perm")?;
    Ok((
        vec![np::transpose(&p[0], Some(perm))?],
        vec![np::transpose(&t[0], Some(perm))?],
    ))
}

fn transpose_transpose(
    cts: &[Value],
    _args: &[TransposeArg],
    params: &Params,
) -> Result<Vec<Option<Value>>> {
    let perm = params.axes("perm")?;
    let mut inverse = vec![0usize; perm.len()];
    for (i, p) in perm.iter().enumerate() {
        inverse[*p] = i;
    }
    Ok(vec![Some(np::transpose(&cts[0], Some(&inverse))?)])
}

fn transpose_batch(
    vals: &[Value],
    dims: &[Option<usize>],
    axis_size: usize,
    params: &Params,
) -> Result<(Vec<Value>, Vec<Option<usize>>)> {
    let perm = params.axes("perm")?;
    let x = move_batch_axis(axis_size, dims[0], 0, &vals[0])?;
    let mut shifted = vec![0usize];
    shifted.extend(perm.iter().map(|p| p + 1));
    Ok((vec![np::transpose(&x, Some(&shifted))?], vec![Some(0)]))
}

// ---------------------------------------------------------------------------
// reshape{shape}
// ---------------------------------------------------------------------------

fn reshape_abstract(ins: &[ShapedArray], params: &Params) -> Result<Vec<ShapedArray>> {
    let shape = params.shape("shape")?;
    let x = &ins[0];
    if shape.iter().product::<usize>() != x.size() {
        return Err(TraceError::ShapeMismatch(format!(
            "cannot reshape {x} to {shape:?}"
        )));
    }
    Ok(vec![ShapedArray::new(shape.to_vec(), x.dtype)])
}

fn reshape_jvp(p: &[Value], t: &[Value], params: &Params) -> Result<(Vec<Value>, Vec<Value>)> {
    let shape = params.shape("shape")?;
    Ok((
        vec![np::reshape(&p[0], shape)?],
        vec![np::reshape(&t[0], shape)?],
    ))
}

fn reshape_transpose(
    cts: &[Value],
    args: &[TransposeArg],
    _params: &Params,
) -> Result<Vec<Option<Value>>> {
    Ok(vec![Some(np::reshape(&cts[0], &args[0].aval().shape)?)])
}

fn reshape_batch(
    vals: &[Value],
    dims: &[Option<usize>],
    axis_size: usize,
    params: &Params,
) -> Result<(Vec<Value>, Vec<Option<usize>>)> {
    let shape = params.shape("shape")?;
    let x = move_batch_axis(axis_size, dims[0], 0, &vals[0])?;
    let mut out_shape = vec![axis_size];
    out_shape.extend_from_slice(shape);
    Ok((vec![np::reshape(&x, &out_shape)?], vec![Some(0)]))
}
