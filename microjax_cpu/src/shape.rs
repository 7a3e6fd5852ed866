//! Structural kernels: `broadcast`, `transpose`, `reshape`. Each computes
//! a source-index table and gathers once.

use crate::util::{kernel_error, linear_index, multi_index, take};
use microjax::error::Result;
use microjax::primitive::Params;
use microjax::{ArrayRef, ArrayValue};
use std::rc::Rc;

fn expect_unary(args: &[ArrayRef]) -> Result<&ArrayValue> {
    match args {
        [a] => Ok(a),
        _ => Err(kernel_error(format!("expected 1 input, got {}", args.len()))),
    }
}

pub(crate) fn broadcast(args: &[ArrayRef], params: &Params) -> Result<Vec<ArrayRef>> {
    let a = expect_unary(args)?;
    let shape = params.shape("shape")?;
    let axes = params.axes("axes")?;
    let kept: Vec<usize> = (0..shape.len()).filter(|d| !axes.contains(d)).collect();
    if kept.len() != a.rank() {
        return Err(kernel_error("broadcast rank mismatch"));
    }
    let out_size: usize = shape.iter().product();
    let indices: Vec<usize> = (0..out_size)
        .map(|linear| {
            let multi = multi_index(linear, shape);
            let in_multi: Vec<usize> = kept
                .iter()
                .enumerate()
                .map(|(i, pos)| if a.shape()[i] == 1 { 0 } else { multi[*pos] })
                .collect();
            linear_index(&in_multi, a.shape())
        })
        .collect();
    Ok(vec![Rc::new(take(a, shape, &indices)?)])
}

pub(crate) fn transpose(args: &[ArrayRef], params: &Params) -> Result<Vec<ArrayRef>> {
    let a = expect_unary(args)?;
    let perm = params.axes("perm")?;
    if perm.len() != a.rank() {
        return Err(kernel_error("transpose permutation rank mismatch"));
    }
    let out_shape: Vec<usize> = perm.iter().map(|p| a.shape()[*p]).collect();
    let out_size: usize = out_shape.iter().product();
    let indices: Vec<usize> = (0..out_size)
        .map(|linear| {
            let multi = multi_index(linear, &out_shape);
            let mut in_multi = vec![0usize; a.rank()];
            for (i, p) in perm.iter().enumerate() {
                in_multi[*p] = multi[i];
            }
            linear_index(&in_multi, a.shape())
        })
        .collect();
    Ok(vec![Rc::new(take(a, &out_shape, &indices)?)])
}

pub(crate) fn reshape(args: &[ArrayRef], params: &Params) -> Result<Vec<ArrayRef>> {
    let a = expect_unary(args)?;
    let shape = params.shape("shape")?;
    if shape.iter().product::<usize>() != a.size() {
        return Err(kernel_error("reshape size mismatch"));
    }
    Ok(vec![Rc::new(ArrayValue::new(
        shape.to_vec(),
        a.data().clone(),
    )?)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use microjax::primitive::ParamValue;

    fn arr(shape: &[usize], data: &[f64]) -> ArrayRef {
        Rc::new(ArrayValue::from_f64(shape, data.to_vec()).unwrap())
    }

    #[test]
    fn transpose_reverses_a_matrix() {
        let x = arr(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let p = Params::new().with("perm", ParamValue::Axes(vec![1, 0]));
        let out = transpose(&[x], &p).unwrap();
        assert_eq!(out[0].shape(), &[3, 2]);
        assert_eq!(
            out[0].to_f64_vec().unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }

    #[test]
    fn broadcast_inserts_a_leading_axis() {
        let x = arr(&[3], &[1.0, 2.0, 3.0]);
        let p = Params::new()
            .with("shape", ParamValue::Shape(vec![2, 3]))
            .with("axes", ParamValue::Axes(vec![0]));
        let out = broadcast(&[x], &p).unwrap();
        assert_eq!(out[0].shape(), &[2, 3]);
        assert_eq!(
            out[0].to_f64_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
        );
    }
}
