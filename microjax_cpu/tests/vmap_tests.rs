//! Batching tests.

mod common;

use approx::assert_relative_eq;
use common::{arg, array, readback, scalar, setup};
use microjax::{grad, np, vmap, GradOptions, Result, Tree};

fn total(args: &[Tree]) -> Result<Tree> {
    let x = arg(args, 0)?;
    Ok(Tree::Leaf(np::sum(x, None)?))
}

#[test]
fn vmap_sum_over_rows_and_columns() {
    setup();
    let x = array(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let rows = vmap(&total, &[Some(0)], 0, &[x.clone()]).unwrap();
    assert_eq!(readback(&rows), vec![6.0, 15.0]);

    let cols = vmap(&total, &[Some(1)], 0, &[x]).unwrap();
    assert_eq!(readback(&cols), vec![5.0, 7.0, 9.0]);
}

#[test]
fn vmap_matches_a_hand_loop() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::add(&np::mul(x, x)?, x)?))
    };
    let rows: [[f64; 2]; 3] = [[1.0, 2.0], [3.0, 4.0], [-1.0, 0.5]];
    let stacked = array(&[3, 2], &[1.0, 2.0, 3.0, 4.0, -1.0, 0.5]);
    let batched = vmap(&f, &[Some(0)], 0, &[stacked]).unwrap();
    let got = readback(&batched);
    for (i, row) in rows.iter().enumerate() {
        let single = f(&[array(&[2], row)]).unwrap();
        let want = readback(&single);
        assert_eq!(&got[i * 2..(i + 1) * 2], &want[..]);
    }
}

#[test]
fn unbatched_arguments_broadcast() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        let y = arg(args, 1)?;
        Ok(Tree::Leaf(np::mul(x, y)?))
    };
    let xs = array(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let y = array(&[3], &[10.0, 100.0, 1000.0]);
    let out = vmap(&f, &[Some(0), None], 0, &[xs, y]).unwrap();
    assert_eq!(
        readback(&out),
        vec![10.0, 200.0, 3000.0, 40.0, 500.0, 6000.0]
    );
}

#[test]
fn out_axes_move_the_batch_dimension() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::neg(x)?))
    };
    let xs = array(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let out = vmap(&f, &[Some(0)], 1, &[xs]).unwrap();
    let leaf = common::leaf(&out);
    assert_eq!(leaf.shape(), vec![3, 2]);
    assert_eq!(readback(&out), vec![-1.0, -4.0, -2.0, -5.0, -3.0, -6.0]);
}

#[test]
fn batched_vector_matrix_products() {
    setup();
    let w = np::array_f64(&[2, 3], &[1.0, 0.0, 2.0, 0.0, 1.0, 3.0]).unwrap();
    let f = move |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::matmul(x, &w)?))
    };
    let xs = array(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let out = vmap(&f, &[Some(0)], 0, &[xs]).unwrap();
    // Row i of the result is xs[i] @ w.
    assert_eq!(readback(&out), vec![1.0, 2.0, 8.0, 3.0, 4.0, 18.0]);
}

#[test]
fn vmap_of_matrix_matrix_products() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let a = arg(args, 0)?;
        let b = arg(args, 1)?;
        Ok(Tree::Leaf(np::matmul(a, b)?))
    };
    let a = array(&[2, 1, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = array(&[2, 2, 1], &[1.0, 1.0, 2.0, 0.5]);
    let out = vmap(&f, &[Some(0), Some(0)], 0, &[a, b]).unwrap();
    let leaf = common::leaf(&out);
    assert_eq!(leaf.shape(), vec![2, 1, 1]);
    assert_eq!(readback(&out), vec![3.0, 8.0]);
}

#[test]
fn vmap_composes_with_grad() {
    setup();
    let square = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::mul(x, x)?))
    };
    let dsquare = move |args: &[Tree]| grad(&square, args, &GradOptions::default());
    let xs = array(&[3], &[1.0, 2.0, 3.0]);
    let out = vmap(&dsquare, &[Some(0)], 0, &[xs]).unwrap();
    let got = readback(&out);
    for (g, x) in got.iter().zip([1.0, 2.0, 3.0]) {
        assert_relative_eq!(*g, 2.0 * x, epsilon = 1e-9);
    }
}

#[test]
fn mismatched_batch_sizes_are_rejected() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        let y = arg(args, 1)?;
        Ok(Tree::Leaf(np::add(x, y)?))
    };
    let a = array(&[2, 3], &[0.0; 6]);
    let b = array(&[4, 3], &[0.0; 12]);
    let err = vmap(&f, &[Some(0), Some(0)], 0, &[a, b]).unwrap_err();
    assert!(matches!(err, microjax::TraceError::ShapeMismatch(_)));
}

#[test]
fn vmap_needs_a_mapped_argument() {
    setup();
    let err = vmap(&total, &[None], 0, &[scalar(1.0)]).unwrap_err();
    assert!(matches!(err, microjax::TraceError::ShapeMismatch(_)));
}
