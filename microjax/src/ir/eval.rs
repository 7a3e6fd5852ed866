//! Jaxpr evaluation.
//!
//! Equations are interpreted through `bind`, so evaluation composes with
//! whatever traces are live: with concrete inputs it executes on the
//! backend, with tracer inputs it re-stages or differentiates. This single
//! function is both the eager implementation of the `jit` primitive and
//! the body of its jvp/batching rules.

use super::core::{Atom, ClosedJaxpr, Jaxpr, VarId};
use crate::error::{Result, TraceError};
use crate::trace::{bind, Value};
use std::collections::HashMap;

/// Evaluate a jaxpr on the given constants and arguments.
pub fn eval_jaxpr(jaxpr: &Jaxpr, consts: &[Value], args: &[Value]) -> Result<Vec<Value>> {
    if consts.len() != jaxpr.const_binders.len() || args.len() != jaxpr.in_binders.len() {
        return Err(TraceError::ShapeMismatch(format!(
            "jaxpr takes {} consts and {} args, got {} and {}",
            jaxpr.const_binders.len(),
            jaxpr.in_binders.len(),
            consts.len(),
            args.len()
        )));
    }

    let mut env: HashMap<VarId, Value> = HashMap::new();
    for (binder, v) in jaxpr.const_binders.iter().zip(consts) {
        env.insert(binder.id, v.clone());
    }
    for (binder, v) in jaxpr.in_binders.iter().zip(args) {
        env.insert(binder.id, v.clone());
    }

    let read = |env: &HashMap<VarId, Value>, atom: &Atom| -> Result<Value> {
        match atom {
            Atom::Var(v) => env.get(&v.id).cloned().ok_or_else(|| {
                TraceError::LevelViolation(format!("unbound binder {} in jaxpr", v.id))
            }),
            Atom::Lit(a) => Ok(Value::Concrete(a.clone())),
        }
    };

    for eqn in &jaxpr.eqns {
        let inputs = eqn
            .inputs
            .iter()
            .map(|a| read(&env, a))
            .collect::<Result<Vec<_>>>()?;
        let outs = bind(&eqn.prim, inputs, eqn.params.clone())?;
        if outs.len() != eqn.out_binders.len() {
            return Err(TraceError::Backend(format!(
                "'{}' returned {} outputs, equation binds {}",
                eqn.prim,
                outs.len(),
                eqn.out_binders.len()
            )));
        }
        for (binder, v) in eqn.out_binders.iter().zip(outs) {
            env.insert(binder.id, v);
        }
    }

    jaxpr.outs.iter().map(|a| read(&env, a)).collect()
}

/// Evaluate a closed jaxpr on the given arguments.
pub fn eval_closed_jaxpr(closed: &ClosedJaxpr, args: &[Value]) -> Result<Vec<Value>> {
    let consts: Vec<Value> = closed
        .consts
        .iter()
        .map(|c| Value::Concrete(c.clone()))
        .collect();
    eval_jaxpr(&closed.jaxpr, &consts, args)
}
