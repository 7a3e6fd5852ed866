//! Reverse-mode tests: vjp, auxiliary outputs, linearize, and the
//! forward/reverse agreement property.

mod common;

use approx::assert_relative_eq;
use common::{arg, array, readback, readback_scalar, setup};
use microjax::{jvp, linearize, np, vjp, vjp_with_aux, DType, Result, Tree};

#[test]
fn vjp_with_aux_returns_primal_aux_and_pullback() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        let main = np::sum(x, None)?;
        let aux = np::mul(&np::scalar(2.0, DType::F64), x)?;
        Ok(Tree::List(vec![Tree::Leaf(main), Tree::Leaf(aux)]))
    };
    let x = array(&[3], &[1.0, 2.0, 3.0]);
    let (primal, backward, aux) = vjp_with_aux(&f, &[x]).unwrap();
    assert_relative_eq!(readback_scalar(&primal), 6.0, epsilon = 1e-9);
    assert_eq!(readback(&aux), vec![2.0, 4.0, 6.0]);

    let cts = backward
        .call(&Tree::Leaf(np::scalar(1.0, DType::F64)))
        .unwrap();
    assert_eq!(readback(&cts[0]), vec![1.0, 1.0, 1.0]);
}

#[test]
fn forward_and_reverse_mode_agree() {
    setup();
    // <c, jvp(v)> == <vjp(c), v> for f(x) = sin(x) * x.
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::mul(&np::sin(x)?, x)?))
    };
    let x = array(&[3], &[0.4, 1.3, -2.2]);
    let v = [0.3, -0.7, 1.9];
    let c = [1.1, 0.2, -0.5];

    let (_, tangent) = jvp(&f, &[x.clone()], &[array(&[3], &v)]).unwrap();
    let forward: f64 = readback(&tangent)
        .iter()
        .zip(c)
        .map(|(t, ci)| t * ci)
        .sum();

    let (_, backward) = vjp(&f, &[x]).unwrap();
    let cts = backward.call(&array(&[3], &c)).unwrap();
    let reverse: f64 = readback(&cts[0]).iter().zip(v).map(|(g, vi)| g * vi).sum();

    assert_relative_eq!(forward, reverse, epsilon = 1e-9);
}

#[test]
fn linearize_captures_a_reusable_linear_map() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::mul(x, x)?))
    };
    let x = array(&[2], &[3.0, 5.0]);
    let (primal, linear) = linearize(&f, &[x.clone()]).unwrap();
    assert_eq!(readback(&primal), vec![9.0, 25.0]);

    // The captured map agrees with jvp at the linearization point, for
    // several tangents, without retracing.
    for v in [[1.0, 0.0], [0.0, 1.0], [0.25, -4.0]] {
        let t = array(&[2], &v);
        let applied = linear.apply(&[t.clone()]).unwrap();
        let (_, expected) = jvp(&f, &[x.clone()], &[t]).unwrap();
        assert_eq!(readback(&applied), readback(&expected));
    }
}

#[test]
fn linearized_programs_are_linear_jaxprs() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::mul(x, x)?))
    };
    let (_, linear) = linearize(&f, &[common::scalar(3.0)]).unwrap();
    // x * x linearizes to t*x + x*t over the tangent input.
    insta::assert_snapshot!(microjax::pretty_jaxpr(linear.jaxpr()), @r"
    { lambda a:f64[] .
      let b:f64[] = mul a 3
          c:f64[] = mul 3 a
          d:f64[] = add b c
      in ( d ) }
    ");
}

#[test]
fn cotangent_structure_is_checked() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::sum(x, None)?))
    };
    let (_, backward) = vjp(&f, &[array(&[2], &[1.0, 2.0])]).unwrap();
    let bad = Tree::List(vec![Tree::Leaf(np::scalar(1.0, DType::F64))]);
    let err = backward.call(&bad).unwrap_err();
    assert!(matches!(
        err,
        microjax::TraceError::PytreeStructureMismatch(_)
    ));
}

#[test]
fn zero_cotangents_for_unused_inputs() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        let _unused = arg(args, 1)?;
        Ok(Tree::Leaf(np::sum(x, None)?))
    };
    let (_, backward) = vjp(
        &f,
        &[array(&[2], &[1.0, 2.0]), array(&[3], &[5.0, 6.0, 7.0])],
    )
    .unwrap();
    let cts = backward
        .call(&Tree::Leaf(np::scalar(1.0, DType::F64)))
        .unwrap();
    assert_eq!(readback(&cts[0]), vec![1.0, 1.0]);
    assert_eq!(readback(&cts[1]), vec![0.0, 0.0, 0.0]);
}
