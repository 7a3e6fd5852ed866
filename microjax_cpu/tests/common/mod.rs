//! Shared helpers for the integration suites.
#![allow(dead_code)] // each suite uses its own subset

use microjax::{np, DType, Result, Tree, Value};

/// Install the CPU kernels (idempotent).
pub fn setup() {
    microjax_cpu::install();
}

/// A scalar `f64` leaf.
pub fn scalar(v: f64) -> Tree {
    Tree::Leaf(np::scalar(v, DType::F64))
}

/// An `f64` array leaf.
pub fn array(shape: &[usize], data: &[f64]) -> Tree {
    Tree::Leaf(np::array_f64(shape, data).expect("valid test array"))
}

/// The single leaf of a tree.
pub fn leaf(tree: &Tree) -> &Value {
    tree.as_leaf().expect("expected a leaf")
}

/// Read a leaf tree back as `f64` data.
pub fn readback(tree: &Tree) -> Vec<f64> {
    leaf(tree)
        .as_concrete()
        .expect("expected a concrete value")
        .to_f64_vec()
        .expect("readable buffer")
}

/// Read a scalar leaf tree back as one `f64`.
pub fn readback_scalar(tree: &Tree) -> f64 {
    leaf(tree)
        .as_concrete()
        .expect("expected a concrete value")
        .scalar_f64()
        .expect("scalar buffer")
}

/// The first leaf of a tree function's argument list.
pub fn arg(args: &[Tree], i: usize) -> Result<&Value> {
    args[i].as_leaf().ok_or_else(|| {
        microjax::TraceError::PytreeStructureMismatch("expected a leaf argument".into())
    })
}
