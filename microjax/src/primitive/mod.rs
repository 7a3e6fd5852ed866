//! Primitive declarations and the process-wide registry.
//!
//! A primitive is a named operation with a fixed arity, a parameter
//! dictionary, and a table of rules: `abstract_eval` (always present),
//! `jvp`, `transpose` (defined only for the inputs the primitive is linear
//! in), and `batch`. The eager `impl` table is supplied separately by the
//! backend (see [`crate::backend`]); the IR refers to primitives by name.
//!
//! The registry is append-only: the core set is installed on first use and
//! later additions are permitted as long as their rule tables are filled
//! before the first `bind`.

mod elementwise;
mod matmul;
mod reduce;
mod shape;
pub(crate) mod staged;

use crate::aval::ShapedArray;
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use crate::ir::Jaxpr;
use crate::trace::Value;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// A literal parameter value attached to an equation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Str(String),
    DType(DType),
    /// A sorted list of axis indices.
    Axes(Vec<usize>),
    /// A target shape.
    Shape(Vec<usize>),
    /// A nested program (higher-order primitives).
    Jaxpr(Rc<Jaxpr>),
}

/// Parameter dictionary of an equation, ordered by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params(pub BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Params {
        Params(BTreeMap::new())
    }

    pub fn with(mut self, name: &str, value: ParamValue) -> Params {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    fn require(&self, name: &str) -> Result<&ParamValue> {
        self.get(name).ok_or_else(|| {
            TraceError::Backend(format!("missing equation parameter '{name}'"))
        })
    }

    pub fn axes(&self, name: &str) -> Result<&[usize]> {
        match self.require(name)? {
            ParamValue::Axes(a) => Ok(a),
            other => Err(param_type_error(name, "axes", other)),
        }
    }

    pub fn shape(&self, name: &str) -> Result<&[usize]> {
        match self.require(name)? {
            ParamValue::Shape(s) => Ok(s),
            other => Err(param_type_error(name, "shape", other)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.require(name)? {
            ParamValue::Int(i) => Ok(*i),
            other => Err(param_type_error(name, "int", other)),
        }
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        match self.require(name)? {
            ParamValue::Str(s) => Ok(s),
            other => Err(param_type_error(name, "str", other)),
        }
    }

    pub fn dtype(&self, name: &str) -> Result<DType> {
        match self.require(name)? {
            ParamValue::DType(d) => Ok(*d),
            other => Err(param_type_error(name, "dtype", other)),
        }
    }

    pub fn jaxpr(&self, name: &str) -> Result<Rc<Jaxpr>> {
        match self.require(name)? {
            ParamValue::Jaxpr(j) => Ok(j.clone()),
            other => Err(param_type_error(name, "jaxpr", other)),
        }
    }
}

fn param_type_error(name: &str, wanted: &str, got: &ParamValue) -> TraceError {
    TraceError::Backend(format!(
        "equation parameter '{name}' should be {wanted}, got {got:?}"
    ))
}

/// One input of an equation during transposition: either a value known from
/// the forward sweep, or a linear placeholder carrying only its type.
#[derive(Debug, Clone)]
pub enum TransposeArg {
    Known(Value),
    Linear(ShapedArray),
}

impl TransposeArg {
    pub fn aval(&self) -> ShapedArray {
        match self {
            TransposeArg::Known(v) => v.shaped_aval(),
            TransposeArg::Linear(a) => a.clone(),
        }
    }

    pub fn known(&self) -> Option<&Value> {
        match self {
            TransposeArg::Known(v) => Some(v),
            TransposeArg::Linear(_) => None,
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, TransposeArg::Linear(_))
    }
}

/// Static type propagation: input avals and params to output avals.
pub type AbstractEvalFn = fn(&[ShapedArray], &Params) -> Result<Vec<ShapedArray>>;

/// Forward differentiation: (primals, tangents, params) to
/// (primal outputs, tangent outputs). Rules are written in terms of the
/// surface operations so they stay traceable under further transformations.
pub type JvpFn = fn(&[Value], &[Value], &Params) -> Result<(Vec<Value>, Vec<Value>)>;

/// Transposition: (output cotangents, inputs, params) to per-input
/// cotangent contributions; `None` for non-linear inputs.
pub type TransposeFn =
    fn(&[Value], &[TransposeArg], &Params) -> Result<Vec<Option<Value>>>;

/// Batching: (values, batch dims, axis size, params) to
/// (output values, output batch dims).
pub type BatchFn = fn(
    &[Value],
    &[Option<usize>],
    usize,
    &Params,
) -> Result<(Vec<Value>, Vec<Option<usize>>)>;

/// A registered operation and its transformation rules.
#[derive(Clone)]
pub struct Primitive {
    pub name: &'static str,
    pub abstract_eval: AbstractEvalFn,
    pub jvp: Option<JvpFn>,
    pub transpose: Option<TransposeFn>,
    pub batch: Option<BatchFn>,
    /// Input positions the primitive can be linear in; transpose rules are
    /// defined only for these. Empty for non-differentiable primitives.
    pub linear_inputs: &'static [usize],
}

impl std::fmt::Debug for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Primitive")
            .field("name", &self.name)
            .field("jvp", &self.jvp.is_some())
            .field("transpose", &self.transpose.is_some())
            .field("batch", &self.batch.is_some())
            .field("linear_inputs", &self.linear_inputs)
            .finish()
    }
}

thread_local! {
    static REGISTRY: RefCell<HashMap<&'static str, Rc<Primitive>>> =
        RefCell::new(HashMap::new());
    static CORE_INSTALLED: RefCell<bool> = const { RefCell::new(false) };
}

/// Add a primitive. Re-registering a name keeps the first definition.
pub fn register_primitive(prim: Primitive) {
    REGISTRY.with(|reg| {
        reg.borrow_mut().entry(prim.name).or_insert_with(|| Rc::new(prim));
    });
}

/// Look up a primitive by name, installing the core set on first use.
pub fn lookup(name: &str) -> Result<Rc<Primitive>> {
    ensure_core_registered();
    REGISTRY.with(|reg| {
        reg.borrow().get(name).cloned().ok_or_else(|| {
            TraceError::MissingRule {
                primitive: name.to_string(),
                transform: "registry",
            }
        })
    })
}

/// Install the core primitive set (idempotent, per thread).
pub fn ensure_core_registered() {
    let fresh = CORE_INSTALLED.with(|f| {
        let mut f = f.borrow_mut();
        let fresh = !*f;
        *f = true;
        fresh
    });
    if fresh {
        elementwise::register_all();
        reduce::register_all();
        shape::register_all();
        matmul::register_all();
        staged::register_all();
    }
}

/// Reduce a cotangent produced under implicit broadcasting back to the
/// type of the input it belongs to: sum over the leading extra axes and
/// over axes the input held with extent 1, then restore shape and dtype.
pub(crate) fn unbroadcast(ct: &crate::trace::Value, target: &ShapedArray) -> Result<crate::trace::Value> {
    use crate::np;
    if ct.shaped_aval() == *target {
        return Ok(ct.clone());
    }
    let ct_shape = ct.shape();
    let lead = ct_shape.len() - target.rank();
    let mut axes: Vec<usize> = (0..lead).collect();
    for (i, d) in target.shape.iter().enumerate() {
        if *d == 1 && ct_shape[lead + i] != 1 {
            axes.push(lead + i);
        }
    }
    let mut out = np::sum(ct, Some(&axes))?;
    if out.shape() != target.shape {
        out = np::reshape(&out, &target.shape)?;
    }
    np::astype(&out, target.dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_set_is_registered_on_first_lookup() {
        for name in [
            "add", "sub", "mul", "div", "neg", "sin", "cos", "exp", "log", "sqrt",
            "greater", "less", "equal", "convert", "reduce_sum", "broadcast",
            "transpose", "reshape", "matmul", "jit",
        ] {
            assert!(lookup(name).is_ok(), "missing primitive {name}");
        }
    }

    #[test]
    fn unknown_primitive_is_a_missing_rule() {
        assert!(matches!(
            lookup("frobnicate"),
            Err(TraceError::MissingRule { .. })
        ));
    }

    #[test]
    fn registration_is_append_only() {
        fn nope(_: &[ShapedArray], _: &Params) -> Result<Vec<ShapedArray>> {
            Ok(vec![])
        }
        let before = lookup("add").unwrap();
        register_primitive(Primitive {
            name: "add",
            abstract_eval: nope,
            jvp: None,
            transpose: None,
            batch: None,
            linear_inputs: &[],
        });
        let after = lookup("add").unwrap();
        assert!(Rc::ptr_eq(&before, &after));
    }
}
