//! The jaxpr trace: partial evaluation and staging.
//!
//! Binds that touch a jaxpr tracer append an equation to the builder and
//! return fresh tracers; binds whose inputs are all known concrete values
//! are constant-folded through the backend instead. Known scalars embed in
//! equations as literals, other captured values (including tracers of
//! outer traces) become constants of the finished jaxpr.

use crate::aval::{Aval, ShapedArray};
use crate::backend;
use crate::error::{Result, TraceError};
use crate::ir::{Atom, Jaxpr, JaxprEqn, Var};
use crate::primitive::{Params, Primitive};
use crate::trace::{
    eager, push_trace, set_dynamic, MainTrace, TraceKind, TracePayload, TracerPayload,
    Value,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Accumulates the pieces of a jaxpr while a trace is live.
#[derive(Debug, Default)]
pub struct JaxprBuilder {
    in_binders: Vec<Var>,
    const_binders: Vec<Var>,
    const_vals: Vec<Value>,
    eqns: Vec<JaxprEqn>,
}

impl JaxprBuilder {
    /// Bind a fresh input binder and return its tracer.
    fn new_input(&mut self, trace: &Rc<MainTrace>, aval: ShapedArray) -> Value {
        let var = Var::fresh(aval.clone());
        let id = var.id;
        self.in_binders.push(var);
        Value::tracer(
            trace.clone(),
            Aval::Shaped(aval),
            TracerPayload::JaxprVar { id },
        )
    }

    /// The atom for a captured value: scalars embed as literals, everything
    /// else becomes (or reuses) a constant binder.
    fn const_atom(&mut self, val: &Value) -> Atom {
        if let Some(a) = val.as_concrete() {
            if a.is_scalar() {
                return Atom::Lit(a.clone());
            }
        }
        for (i, existing) in self.const_vals.iter().enumerate() {
            if existing.identical(val) {
                return Atom::Var(self.const_binders[i].clone());
            }
        }
        let var = Var::fresh(val.shaped_aval());
        self.const_binders.push(var.clone());
        self.const_vals.push(val.clone());
        Atom::Var(var)
    }

    /// The atom for any traced value at finish time.
    fn out_atom(&mut self, trace: &Rc<MainTrace>, val: &Value) -> Atom {
        if let Value::Tracer(t) = val {
            if Rc::ptr_eq(&t.trace, trace) {
                match &t.payload {
                    TracerPayload::JaxprVar { id } => {
                        return Atom::Var(Var {
                            id: *id,
                            aval: t.aval.to_shaped(),
                        })
                    }
                    TracerPayload::JaxprConst { val } => {
                        let val = val.clone();
                        return self.const_atom(&val);
                    }
                    _ => {}
                }
            }
        }
        self.const_atom(val)
    }
}

pub(crate) fn process(
    top: &Rc<MainTrace>,
    prim: &Primitive,
    args: &[Value],
    params: &Params,
) -> Result<Vec<Value>> {
    let builder = top.builder().ok_or_else(|| {
        TraceError::LevelViolation("jaxpr trace lost its builder".into())
    })?;

    // Constant folding: all inputs known, and the backend can execute.
    let known: Option<Vec<_>> = args
        .iter()
        .map(|a| match a {
            Value::Tracer(t) => match &t.payload {
                TracerPayload::JaxprConst { val } => {
                    val.as_concrete().cloned()
                }
                _ => None,
            },
            Value::Concrete(a) => Some(a.clone()),
        })
        .collect();
    if let Some(concrete) = known {
        if prim.name == "jit" || backend::has_impl(prim.name) {
            match eager::exec(prim.name, &concrete, params) {
                Ok(outs) => {
                    tracing::debug!(prim = prim.name, "constant fold");
                    return Ok(outs.into_iter().map(Value::Concrete).collect());
                }
                // No kernel for an inner primitive: stage instead.
                Err(TraceError::MissingRule { .. }) => {}
                Err(other) => return Err(other),
            }
        }
    }

    let in_avals: Vec<ShapedArray> = args.iter().map(Value::shaped_aval).collect();
    let out_avals = (prim.abstract_eval)(&in_avals, params)?;

    let mut builder = builder.borrow_mut();
    let inputs: Vec<Atom> = args
        .iter()
        .map(|a| match a {
            Value::Tracer(t) if Rc::ptr_eq(&t.trace, top) => match &t.payload {
                TracerPayload::JaxprVar { id } => Ok(Atom::Var(Var {
                    id: *id,
                    aval: t.aval.to_shaped(),
                })),
                TracerPayload::JaxprConst { val } => {
                    let val = val.clone();
                    Ok(builder.const_atom(&val))
                }
                other => Err(TraceError::LevelViolation(format!(
                    "jaxpr trace received a foreign tracer payload {other:?}"
                ))),
            },
            _ => Err(TraceError::LevelViolation(
                "jaxpr trace received an unlifted value".into(),
            )),
        })
        .collect::<Result<_>>()?;

    let out_binders: Vec<Var> = out_avals.iter().cloned().map(Var::fresh).collect();
    builder.eqns.push(JaxprEqn {
        prim: prim.name.to_string(),
        inputs,
        params: params.clone(),
        out_binders: out_binders.clone(),
    });
    tracing::debug!(prim = prim.name, "stage equation");

    Ok(out_binders
        .into_iter()
        .map(|v| {
            let id = v.id;
            Value::tracer(
                top.clone(),
                Aval::Shaped(v.aval),
                TracerPayload::JaxprVar { id },
            )
        })
        .collect())
}

/// Trace `f` to a jaxpr on the given input types.
///
/// The produced constants are arbitrary values: concrete captures in the
/// common case, tracers of outer traces when staging happens under another
/// transformation. The jaxpr trace is installed as the dynamic trace so
/// every bind in `f`'s extent stages (or folds) here.
pub(crate) fn trace_to_jaxpr(
    f: &dyn Fn(&[Value]) -> Result<Vec<Value>>,
    in_avals: &[ShapedArray],
) -> Result<(Jaxpr, Vec<Value>)> {
    let builder = Rc::new(RefCell::new(JaxprBuilder::default()));
    let guard = push_trace(TraceKind::Jaxpr, TracePayload::Jaxpr(builder.clone()));
    let trace = guard.trace();
    let dynamic = set_dynamic(trace.clone());

    let ins: Vec<Value> = in_avals
        .iter()
        .map(|aval| builder.borrow_mut().new_input(&trace, aval.clone()))
        .collect();
    let outs = f(&ins)?;
    drop(dynamic);

    let jaxpr = finish(&builder, &trace, &outs);
    drop(guard);
    jaxpr.typecheck()?;
    let consts = builder.borrow().const_vals.clone();
    Ok((jaxpr, consts))
}

/// Build a jaxpr from a live builder and the traced outputs, without
/// installing a dynamic trace (used by linearization, where only tangent
/// inputs are traced).
pub(crate) fn finish(
    builder: &Rc<RefCell<JaxprBuilder>>,
    trace: &Rc<MainTrace>,
    outs: &[Value],
) -> Jaxpr {
    let mut b = builder.borrow_mut();
    let out_atoms: Vec<Atom> = outs.iter().map(|v| b.out_atom(trace, v)).collect();
    Jaxpr {
        const_binders: b.const_binders.clone(),
        in_binders: b.in_binders.clone(),
        eqns: b.eqns.clone(),
        outs: out_atoms,
    }
}

/// Push a jaxpr trace and create input tracers, leaving the trace live.
/// Used by linearization, which layers a JVP trace on top.
pub(crate) fn open_trace(
    in_avals: &[ShapedArray],
) -> (super::TraceGuard, Rc<RefCell<JaxprBuilder>>, Vec<Value>) {
    let builder = Rc::new(RefCell::new(JaxprBuilder::default()));
    let guard = push_trace(TraceKind::Jaxpr, TracePayload::Jaxpr(builder.clone()));
    let trace = guard.trace();
    let ins: Vec<Value> = in_avals
        .iter()
        .map(|aval| builder.borrow_mut().new_input(&trace, aval.clone()))
        .collect();
    (guard, builder, ins)
}

/// Consts of a builder (shared with [`open_trace`] callers).
pub(crate) fn const_vals(builder: &Rc<RefCell<JaxprBuilder>>) -> Vec<Value> {
    builder.borrow().const_vals.clone()
}
