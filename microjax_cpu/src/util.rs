//! Index arithmetic shared by the kernels. Buffers are row-major.

use microjax::error::{Result, TraceError};
use microjax::{ArrayData, ArrayValue};

/// Decompose a row-major linear index.
pub(crate) fn multi_index(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut multi = vec![0usize; shape.len()];
    for i in (0..shape.len()).rev() {
        multi[i] = linear % shape[i];
        linear /= shape[i];
    }
    multi
}

/// Recompose a row-major linear index.
pub(crate) fn linear_index(multi: &[usize], shape: &[usize]) -> usize {
    let mut linear = 0usize;
    for (m, d) in multi.iter().zip(shape) {
        linear = linear * d + m;
    }
    linear
}

/// Gather `indices` out of `x` into a buffer of shape `out_shape`.
pub(crate) fn take(x: &ArrayValue, out_shape: &[usize], indices: &[usize]) -> Result<ArrayValue> {
    fn pick<T: Copy>(v: &[T], indices: &[usize]) -> Vec<T> {
        indices.iter().map(|i| v[*i]).collect()
    }
    let data = match x.data() {
        ArrayData::Bool(v) => ArrayData::Bool(pick(v, indices)),
        ArrayData::I32(v) => ArrayData::I32(pick(v, indices)),
        ArrayData::I64(v) => ArrayData::I64(pick(v, indices)),
        ArrayData::F16(v) => ArrayData::F16(pick(v, indices)),
        ArrayData::F32(v) => ArrayData::F32(pick(v, indices)),
        ArrayData::F64(v) => ArrayData::F64(pick(v, indices)),
        ArrayData::C64(v) => ArrayData::C64(pick(v, indices)),
    };
    ArrayValue::new(out_shape.to_vec(), data)
}

/// Materialise `x` broadcast to `out_shape` (trailing-aligned, extent 1
/// repeats).
pub(crate) fn expand(x: &ArrayValue, out_shape: &[usize]) -> Result<ArrayValue> {
    if x.shape() == out_shape {
        return Ok(x.clone());
    }
    let out_size: usize = out_shape.iter().product();
    let offset = out_shape.len() - x.rank();
    let indices: Vec<usize> = (0..out_size)
        .map(|linear| {
            let multi = multi_index(linear, out_shape);
            let in_multi: Vec<usize> = x
                .shape()
                .iter()
                .enumerate()
                .map(|(i, d)| if *d == 1 { 0 } else { multi[offset + i] })
                .collect();
            linear_index(&in_multi, x.shape())
        })
        .collect();
    take(x, out_shape, &indices)
}

/// Backend-side error for malformed kernel inputs.
pub(crate) fn kernel_error(msg: impl Into<String>) -> TraceError {
    TraceError::Backend(msg.into())
}
