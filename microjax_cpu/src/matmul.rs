//! Matrix-product kernel.
//!
//! Operands normalise to stacked matrices `(batch, rows, cols)`; each
//! batch slice multiplies through nalgebra for float and complex dtypes
//! and a plain triple loop for the integer dtypes. Vector operands gain
//! and then shed unit dimensions, numpy style.

use crate::util::kernel_error;
use half::f16;
use microjax::error::Result;
use microjax::primitive::Params;
use microjax::{ArrayData, ArrayRef, ArrayValue, DType};
use nalgebra::DMatrix;
use num_complex::Complex;
use std::ops::{AddAssign, Mul};
use std::rc::Rc;

struct Operand {
    batch: usize,
    rows: usize,
    cols: usize,
}

fn normalize_x(shape: &[usize]) -> Option<Operand> {
    match shape.len() {
        1 => Some(Operand { batch: 1, rows: 1, cols: shape[0] }),
        2 => Some(Operand { batch: 1, rows: shape[0], cols: shape[1] }),
        3 => Some(Operand { batch: shape[0], rows: shape[1], cols: shape[2] }),
        _ => None,
    }
}

fn normalize_y(shape: &[usize]) -> Option<Operand> {
    match shape.len() {
        1 => Some(Operand { batch: 1, rows: shape[0], cols: 1 }),
        2 => Some(Operand { batch: 1, rows: shape[0], cols: shape[1] }),
        3 => Some(Operand { batch: shape[0], rows: shape[1], cols: shape[2] }),
        _ => None,
    }
}

fn out_shape(x_rank: usize, y_rank: usize, b: usize, m: usize, n: usize) -> Vec<usize> {
    match (x_rank, y_rank) {
        (1, 1) => vec![],
        (1, 2) => vec![n],
        (2, 1) => vec![m],
        (2, 2) => vec![m, n],
        (1, 3) => vec![b, n],
        (3, 1) => vec![b, m],
        _ => vec![b, m, n],
    }
}

fn mm_nalgebra<T>(x: &[T], y: &[T], m: usize, k: usize, n: usize) -> Vec<T>
where
    T: nalgebra::Scalar + num_traits::Zero + num_traits::One + AddAssign + Mul<Output = T> + Copy,
    DMatrix<T>: Mul<DMatrix<T>, Output = DMatrix<T>>,
{
    let a = DMatrix::from_row_slice(m, k, x);
    let b = DMatrix::from_row_slice(k, n, y);
    let c = a * b;
    let mut out = Vec::with_capacity(m * n);
    for i in 0..m {
        for j in 0..n {
            out.push(c[(i, j)]);
        }
    }
    out
}

fn mm_int<T>(x: &[T], y: &[T], m: usize, k: usize, n: usize) -> Vec<T>
where
    T: Copy + Default + AddAssign + Mul<Output = T>,
{
    let mut out = vec![T::default(); m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = T::default();
            for p in 0..k {
                acc += x[i * k + p] * y[p * n + j];
            }
            out[i * n + j] = acc;
        }
    }
    out
}

pub(crate) fn matmul(args: &[ArrayRef], _params: &Params) -> Result<Vec<ArrayRef>> {
    let (a, b) = match args {
        [a, b] => (a, b),
        _ => return Err(kernel_error("matmul expects 2 inputs")),
    };
    let dtype = DType::promote(a.dtype(), b.dtype());
    if dtype == DType::Bool {
        return Err(kernel_error("matmul of bool data"));
    }
    let a = a.astype(dtype)?;
    let b = b.astype(dtype)?;

    let x = normalize_x(a.shape())
        .ok_or_else(|| kernel_error(format!("matmul operand of rank {}", a.rank())))?;
    let y = normalize_y(b.shape())
        .ok_or_else(|| kernel_error(format!("matmul operand of rank {}", b.rank())))?;
    if x.cols != y.rows {
        return Err(kernel_error(format!(
            "matmul contraction mismatch: {:?} with {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let batch = if x.batch == y.batch || y.batch == 1 {
        x.batch.max(y.batch)
    } else if x.batch == 1 {
        y.batch
    } else {
        return Err(kernel_error(format!(
            "matmul batch mismatch: {:?} with {:?}",
            a.shape(),
            b.shape()
        )));
    };
    let (m, k, n) = (x.rows, x.cols, y.cols);
    let shape = out_shape(a.rank(), b.rank(), batch, m, n);

    macro_rules! batched {
        ($xs:expr, $ys:expr, $mm:expr) => {{
            let mut out = Vec::with_capacity(batch * m * n);
            for ib in 0..batch {
                let xi = if x.batch == 1 { 0 } else { ib };
                let yi = if y.batch == 1 { 0 } else { ib };
                let xs = &$xs[xi * m * k..(xi + 1) * m * k];
                let ys = &$ys[yi * k * n..(yi + 1) * k * n];
                out.extend($mm(xs, ys, m, k, n));
            }
            out
        }};
    }

    let data = match (a.data(), b.data()) {
        (ArrayData::F64(xs), ArrayData::F64(ys)) => {
            ArrayData::F64(batched!(xs, ys, mm_nalgebra::<f64>))
        }
        (ArrayData::F32(xs), ArrayData::F32(ys)) => {
            ArrayData::F32(batched!(xs, ys, mm_nalgebra::<f32>))
        }
        (ArrayData::C64(xs), ArrayData::C64(ys)) => {
            ArrayData::C64(batched!(xs, ys, mm_nalgebra::<Complex<f32>>))
        }
        (ArrayData::F16(xs), ArrayData::F16(ys)) => {
            let xf: Vec<f32> = xs.iter().map(|v| v.to_f32()).collect();
            let yf: Vec<f32> = ys.iter().map(|v| v.to_f32()).collect();
            let out = batched!(xf, yf, mm_nalgebra::<f32>);
            ArrayData::F16(out.into_iter().map(f16::from_f32).collect())
        }
        (ArrayData::I32(xs), ArrayData::I32(ys)) => {
            ArrayData::I32(batched!(xs, ys, mm_int::<i32>))
        }
        (ArrayData::I64(xs), ArrayData::I64(ys)) => {
            ArrayData::I64(batched!(xs, ys, mm_int::<i64>))
        }
        _ => return Err(kernel_error("matmul operands failed to coerce")),
    };
    Ok(vec![Rc::new(ArrayValue::new(shape, data)?)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(shape: &[usize], data: &[f64]) -> ArrayRef {
        Rc::new(ArrayValue::from_f64(shape, data.to_vec()).unwrap())
    }

    #[test]
    fn matrix_times_matrix() {
        let a = arr(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = arr(&[2, 2], &[5.0, 6.0, 7.0, 8.0]);
        let out = matmul(&[a, b], &Params::new()).unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn vector_contractions_shed_unit_dims() {
        let v = arr(&[2], &[1.0, 2.0]);
        let m = arr(&[2, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let out = matmul(&[v.clone(), m], &Params::new()).unwrap();
        assert_eq!(out[0].shape(), &[3]);
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![1.0, 2.0, 0.0]);

        let dot = matmul(&[v.clone(), v], &Params::new()).unwrap();
        assert_eq!(dot[0].shape(), &[] as &[usize]);
        assert_eq!(dot[0].to_f64_vec().unwrap(), vec![5.0]);
    }

    #[test]
    fn one_stacked_dimension_broadcasts() {
        let a = arr(&[2, 1, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = arr(&[2, 2], &[1.0, 0.0, 0.0, 1.0]);
        let out = matmul(&[a, b], &Params::new()).unwrap();
        assert_eq!(out[0].shape(), &[2, 1, 2]);
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
