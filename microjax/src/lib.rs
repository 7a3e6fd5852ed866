// Prevent accidental debug output in library code; structured events go
// through `tracing`.
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]

//! MicroJax: a tracing autodiff core.
//!
//! Expressions over [`trace::Value`]s are not executed as written: every
//! operation routes through `bind`, and the interpreter stack decides
//! whether to execute eagerly, record a typed IR ("jaxpr"), push tangents
//! forward, or broadcast along a batch axis. Program transformations
//! ([`api::jvp`], [`api::vjp`], [`api::grad`], [`api::vmap`],
//! [`jit::jit`]) compose by stacking interpreters.
//!
//! The core implements no mathematical primitive itself: kernels are
//! registered per primitive name by a backend crate (see [`backend`]).

// Data model
pub mod array;
pub mod aval;
pub mod dtype;
pub mod error;

// Containers
pub mod pytree;

// Primitives and their rule tables
pub mod primitive;

// Backend impl table (consumed interface)
pub mod backend;

// Typed IR
pub mod ir;

// Interpreter stack
pub mod trace;

// Reverse-mode transposition
mod transpose;

// Transformations
pub mod api;
pub mod jit;

// Numpy-like surface
pub mod np;

pub use api::{
    grad, grad_with_aux, jacfwd, jacrev, jvp, linearize, make_jaxpr, value_and_grad,
    vjp, vjp_with_aux, vmap, GradOptions, LinearMap, TreeFn, VjpBackward,
};
pub use array::{ArrayData, ArrayRef, ArrayValue, Completion};
pub use aval::{Aval, ShapedArray};
pub use dtype::DType;
pub use error::{Result, TraceError};
pub use ir::{pretty_jaxpr, ClosedJaxpr, Jaxpr};
pub use jit::{jit, JitOptions, Jitted};
pub use pytree::{Tree, TreeDef};
pub use trace::Value;
