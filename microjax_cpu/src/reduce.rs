//! Reduction kernels.

use crate::util::{kernel_error, linear_index, multi_index};
use half::f16;
use microjax::error::Result;
use microjax::primitive::Params;
use microjax::{ArrayData, ArrayRef, ArrayValue};
use num_complex::Complex;
use std::ops::AddAssign;
use std::rc::Rc;

fn reduced_shape(shape: &[usize], axes: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, d)| (!axes.contains(&i)).then_some(*d))
        .collect()
}

fn sum_typed<T: Copy + AddAssign>(
    data: &[T],
    shape: &[usize],
    axes: &[usize],
    zero: T,
) -> Vec<T> {
    let out_shape = reduced_shape(shape, axes);
    let out_size: usize = out_shape.iter().product();
    let mut out = vec![zero; out_size];
    for (linear, v) in data.iter().enumerate() {
        let multi = multi_index(linear, shape);
        let out_multi: Vec<usize> = multi
            .iter()
            .enumerate()
            .filter_map(|(i, m)| (!axes.contains(&i)).then_some(*m))
            .collect();
        out[linear_index(&out_multi, &out_shape)] += *v;
    }
    out
}

pub(crate) fn reduce_sum(args: &[ArrayRef], params: &Params) -> Result<Vec<ArrayRef>> {
    let a = match args {
        [a] => a,
        _ => return Err(kernel_error("reduce_sum expects 1 input")),
    };
    let axes = params.axes("axes")?;
    let shape = reduced_shape(a.shape(), axes);
    let data = match a.data() {
        ArrayData::I32(v) => ArrayData::I32(sum_typed(v, a.shape(), axes, 0)),
        ArrayData::I64(v) => ArrayData::I64(sum_typed(v, a.shape(), axes, 0)),
        ArrayData::F16(v) => {
            ArrayData::F16(sum_typed(v, a.shape(), axes, f16::from_f32(0.0)))
        }
        ArrayData::F32(v) => ArrayData::F32(sum_typed(v, a.shape(), axes, 0.0)),
        ArrayData::F64(v) => ArrayData::F64(sum_typed(v, a.shape(), axes, 0.0)),
        ArrayData::C64(v) => {
            ArrayData::C64(sum_typed(v, a.shape(), axes, Complex::new(0.0, 0.0)))
        }
        ArrayData::Bool(_) => return Err(kernel_error("sum of bool data")),
    };
    Ok(vec![Rc::new(ArrayValue::new(shape, data)?)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use microjax::primitive::ParamValue;

    fn arr(shape: &[usize], data: &[f64]) -> ArrayRef {
        Rc::new(ArrayValue::from_f64(shape, data.to_vec()).unwrap())
    }

    fn axes(a: &[usize]) -> Params {
        Params::new().with("axes", ParamValue::Axes(a.to_vec()))
    }

    #[test]
    fn sums_selected_axes() {
        let x = arr(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rows = reduce_sum(&[x.clone()], &axes(&[1])).unwrap();
        assert_eq!(rows[0].to_f64_vec().unwrap(), vec![6.0, 15.0]);
        let cols = reduce_sum(&[x.clone()], &axes(&[0])).unwrap();
        assert_eq!(cols[0].to_f64_vec().unwrap(), vec![5.0, 7.0, 9.0]);
        let all = reduce_sum(&[x], &axes(&[0, 1])).unwrap();
        assert_eq!(all[0].to_f64_vec().unwrap(), vec![21.0]);
    }

    #[test]
    fn empty_axes_is_the_identity() {
        let x = arr(&[3], &[1.0, 2.0, 3.0]);
        let out = reduce_sum(&[x], &axes(&[])).unwrap();
        assert_eq!(out[0].shape(), &[3]);
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
