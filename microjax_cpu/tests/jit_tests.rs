//! Jit tests: dispatch, cache behaviour, nesting, and composition with
//! the other transformations.

mod common;

use approx::assert_relative_eq;
use common::{arg, array, readback, readback_scalar, scalar, setup};
use microjax::{
    grad, jit, jvp, np, vmap, GradOptions, JitOptions, Jitted, Result, Tree,
};

fn jit_square() -> Jitted {
    jit(
        |args: &[Tree]| -> Result<Tree> {
            let x = arg(args, 0)?;
            Ok(Tree::Leaf(np::mul(x, x)?))
        },
        JitOptions {
            name: "square".into(),
            ..Default::default()
        },
    )
}

#[test]
fn jit_matches_the_eager_result() {
    setup();
    let f = jit_square();
    assert_relative_eq!(
        readback_scalar(&f.call(&[scalar(3.0)]).unwrap()),
        9.0,
        epsilon = 1e-9
    );
}

#[test_log::test]
fn the_cache_compiles_once_per_signature() {
    setup();
    let f = jit_square();
    f.call(&[scalar(3.0)]).unwrap();
    f.call(&[scalar(4.0)]).unwrap();
    assert_eq!(f.cache_size(), 1);

    f.call(&[array(&[2], &[1.0, 2.0])]).unwrap();
    assert_eq!(f.cache_size(), 2);
}

#[test]
fn jvp_reaches_through_jit() {
    setup();
    let f = jit_square();
    let g = move |args: &[Tree]| f.call(args);
    let (primal, tangent) = jvp(&g, &[scalar(3.0)], &[scalar(1.0)]).unwrap();
    assert_relative_eq!(readback_scalar(&primal), 9.0, epsilon = 1e-9);
    assert_relative_eq!(readback_scalar(&tangent), 6.0, epsilon = 1e-9);
}

#[test]
fn grad_reaches_through_jit() {
    setup();
    let f = jit_square();
    let g = move |args: &[Tree]| f.call(args);
    let dg = grad(&g, &[scalar(3.0)], &GradOptions::default()).unwrap();
    assert_relative_eq!(readback_scalar(&dg), 6.0, epsilon = 1e-9);
}

#[test]
fn vmap_reaches_through_jit() {
    setup();
    let f = jit_square();
    let g = move |args: &[Tree]| f.call(args);
    let out = vmap(&g, &[Some(0)], 0, &[array(&[3], &[1.0, 2.0, 3.0])]).unwrap();
    assert_eq!(readback(&out), vec![1.0, 4.0, 9.0]);
}

#[test]
fn jit_of_jit_behaves_like_jit() {
    setup();
    let inner = jit_square();
    let outer = jit(
        move |args: &[Tree]| inner.call(args),
        JitOptions {
            name: "outer".into(),
            ..Default::default()
        },
    );
    assert_relative_eq!(
        readback_scalar(&outer.call(&[scalar(5.0)]).unwrap()),
        25.0,
        epsilon = 1e-9
    );
    // Same signature again: both layers reuse their cached programs.
    assert_relative_eq!(
        readback_scalar(&outer.call(&[scalar(6.0)]).unwrap()),
        36.0,
        epsilon = 1e-9
    );
    assert_eq!(outer.cache_size(), 1);
}

#[test]
fn static_arguments_fold_and_key_the_cache() {
    setup();
    let f = jit(
        |args: &[Tree]| -> Result<Tree> {
            let x = arg(args, 0)?;
            let scale = arg(args, 1)?;
            Ok(Tree::Leaf(np::mul(x, scale)?))
        },
        JitOptions {
            static_argnums: vec![1],
            name: "scale".into(),
        },
    );
    let out = f.call(&[scalar(3.0), scalar(2.0)]).unwrap();
    assert_relative_eq!(readback_scalar(&out), 6.0, epsilon = 1e-9);
    assert_eq!(f.cache_size(), 1);

    // A new static value is a new cache entry, not a wrong answer.
    let out = f.call(&[scalar(3.0), scalar(5.0)]).unwrap();
    assert_relative_eq!(readback_scalar(&out), 15.0, epsilon = 1e-9);
    assert_eq!(f.cache_size(), 2);

    // The same static value hits the existing entry.
    f.call(&[scalar(7.0), scalar(5.0)]).unwrap();
    assert_eq!(f.cache_size(), 2);
}

#[test]
fn jitted_functions_can_close_over_arrays() {
    setup();
    let bias = np::array_f64(&[2], &[10.0, 20.0]).unwrap();
    let f = jit(
        move |args: &[Tree]| -> Result<Tree> {
            let x = arg(args, 0)?;
            Ok(Tree::Leaf(np::add(x, &bias)?))
        },
        JitOptions {
            name: "biased".into(),
            ..Default::default()
        },
    );
    let out = f.call(&[array(&[2], &[1.0, 2.0])]).unwrap();
    assert_eq!(readback(&out), vec![11.0, 22.0]);
}

#[test]
fn pytree_outputs_flow_through_jit() {
    setup();
    let f = jit(
        |args: &[Tree]| -> Result<Tree> {
            let x = arg(args, 0)?;
            let mut out = std::collections::BTreeMap::new();
            out.insert("sq".to_string(), Tree::Leaf(np::mul(x, x)?));
            out.insert("total".to_string(), Tree::Leaf(np::sum(x, None)?));
            Ok(Tree::Dict(out))
        },
        JitOptions {
            name: "stats".into(),
            ..Default::default()
        },
    );
    let out = f.call(&[array(&[2], &[3.0, 4.0])]).unwrap();
    match out {
        Tree::Dict(map) => {
            assert_eq!(readback(&map["sq"]), vec![9.0, 16.0]);
            assert_eq!(readback(&map["total"]), vec![7.0]);
        }
        other => panic!("expected a dict output, got {other:?}"),
    }
}
