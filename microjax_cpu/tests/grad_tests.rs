//! Differentiation tests: grad, value_and_grad, nested grad, Jacobians,
//! and the finite-difference property.

mod common;

use approx::assert_relative_eq;
use common::{arg, array, readback, readback_scalar, scalar, setup};
use microjax::{grad, jacfwd, jacrev, jvp, np, value_and_grad, GradOptions, Result, Tree};

fn cube(args: &[Tree]) -> Result<Tree> {
    let x = arg(args, 0)?;
    let x2 = np::mul(x, x)?;
    Ok(Tree::Leaf(np::mul(&x2, x)?))
}

fn sin_of_cos(args: &[Tree]) -> Result<Tree> {
    let x = arg(args, 0)?;
    Ok(Tree::Leaf(np::sin(&np::cos(x)?)?))
}

#[test]
fn cube_gradient() {
    setup();
    let g = grad(&cube, &[scalar(4.0)], &GradOptions::default()).unwrap();
    assert_relative_eq!(readback_scalar(&g), 48.0, epsilon = 1e-9);
}

#[test]
fn jvp_forward_pass_equals_the_primal() {
    setup();
    let (primal, tangent) = jvp(&cube, &[scalar(4.0)], &[scalar(1.0)]).unwrap();
    assert_relative_eq!(readback_scalar(&primal), 64.0, epsilon = 1e-9);
    assert_relative_eq!(readback_scalar(&tangent), 48.0, epsilon = 1e-9);
}

#[test]
fn sin_cos_first_derivative() {
    setup();
    let g = grad(&sin_of_cos, &[scalar(3.0)], &GradOptions::default()).unwrap();
    assert_relative_eq!(readback_scalar(&g), -0.077432003, epsilon = 1e-5);
}

#[test]
fn sin_cos_second_derivative() {
    setup();
    let first = |args: &[Tree]| grad(&sin_of_cos, args, &GradOptions::default());
    let second = grad(&first, &[scalar(3.0)], &GradOptions::default()).unwrap();
    assert_relative_eq!(readback_scalar(&second), 0.559854311, epsilon = 1e-5);
}

#[test]
fn gradient_matches_central_differences() {
    setup();
    let eps = 1e-5;
    for x in [0.3, 1.7, -2.4] {
        let g = readback_scalar(
            &grad(&sin_of_cos, &[scalar(x)], &GradOptions::default()).unwrap(),
        );
        let hi = readback_scalar(&sin_of_cos(&[scalar(x + eps)]).unwrap());
        let lo = readback_scalar(&sin_of_cos(&[scalar(x - eps)]).unwrap());
        assert_relative_eq!(g, (hi - lo) / (2.0 * eps), epsilon = 1e-6);
    }
}

#[test]
fn value_and_grad_agree() {
    setup();
    let (value, g) =
        value_and_grad(&cube, &[scalar(2.0)], &GradOptions::default()).unwrap();
    assert_relative_eq!(readback_scalar(&value), 8.0, epsilon = 1e-9);
    assert_relative_eq!(readback_scalar(&g), 12.0, epsilon = 1e-9);
}

#[test]
fn gradients_flow_through_elementwise_sums() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::sum(&np::mul(&np::sin(x)?, x)?, None)?))
    };
    let g = grad(&f, &[array(&[3], &[0.5, 1.0, 2.0])], &GradOptions::default()).unwrap();
    let got = readback(&g);
    for (gi, x) in got.iter().zip([0.5f64, 1.0, 2.0]) {
        // d/dx x sin x = sin x + x cos x
        assert_relative_eq!(*gi, x.sin() + x * x.cos(), epsilon = 1e-9);
    }
}

#[test]
fn argnums_select_the_differentiated_argument() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        let y = arg(args, 1)?;
        Ok(Tree::Leaf(np::mul(x, &np::mul(y, y)?)?))
    };
    let opts = GradOptions {
        argnums: vec![1],
        ..Default::default()
    };
    let g = grad(&f, &[scalar(3.0), scalar(5.0)], &opts).unwrap();
    // d/dy x y^2 = 2 x y
    assert_relative_eq!(readback_scalar(&g), 30.0, epsilon = 1e-9);

    let both = GradOptions {
        argnums: vec![0, 1],
        ..Default::default()
    };
    let g = grad(&f, &[scalar(3.0), scalar(5.0)], &both).unwrap();
    match g {
        Tree::List(parts) => {
            assert_relative_eq!(readback_scalar(&parts[0]), 25.0, epsilon = 1e-9);
            assert_relative_eq!(readback_scalar(&parts[1]), 30.0, epsilon = 1e-9);
        }
        other => panic!("expected a list of gradients, got {other:?}"),
    }
}

#[test]
fn jacobians_of_an_elementwise_square() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::mul(x, x)?))
    };
    let x = array(&[3], &[1.0, 2.0, 3.0]);
    let fwd = jacfwd(&f, &[x.clone()]).unwrap();
    let rev = jacrev(&f, &[x]).unwrap();
    let expected = [
        2.0, 0.0, 0.0, //
        0.0, 4.0, 0.0, //
        0.0, 0.0, 6.0,
    ];
    for j in [fwd, rev] {
        assert_eq!(j.shape(), vec![3, 3]);
        let data = j.as_concrete().unwrap().to_f64_vec().unwrap();
        for (got, want) in data.iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-9);
        }
    }
}

#[test]
fn grad_of_a_vector_output_is_refused() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::mul(x, x)?))
    };
    let err = grad(&f, &[array(&[2], &[1.0, 2.0])], &GradOptions::default()).unwrap_err();
    assert!(matches!(err, microjax::TraceError::OutputNotScalar(_)));
}

#[test]
fn grad_of_a_bool_output_is_refused() {
    setup();
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        Ok(Tree::Leaf(np::greater(x, &np::scalar(0.0, microjax::DType::F64))?))
    };
    let err = grad(&f, &[scalar(1.0)], &GradOptions::default()).unwrap_err();
    assert!(matches!(err, microjax::TraceError::DTypeMismatch(_)));
}

#[test]
fn comparison_tangents_are_zero_but_do_not_poison() {
    setup();
    // f(x) = x * 1[x > 0] has zero tangent through the comparison branch.
    let f = |args: &[Tree]| -> Result<Tree> {
        let x = arg(args, 0)?;
        let gate = np::greater(x, &np::scalar(0.0, microjax::DType::F64))?;
        let gate = np::astype(&gate, microjax::DType::F64)?;
        Ok(Tree::Leaf(np::mul(x, &gate)?))
    };
    let g = grad(&f, &[scalar(2.0)], &GradOptions::default()).unwrap();
    assert_relative_eq!(readback_scalar(&g), 1.0, epsilon = 1e-9);
}
