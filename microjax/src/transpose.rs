//! Transposition of linear jaxprs: the backward half of reverse-mode AD.
//!
//! The input program is linear in its input binders (the tangent inputs of
//! a linearization); constants carry the known values. A forward sweep
//! evaluates the equations that touch no linear binder (through `bind`, so
//! nested transformations compose); the backward sweep walks the equations
//! in reverse exactly once, applying per-primitive transpose rules and
//! accumulating cotangents, with zeros where nothing accumulated.

use crate::error::{Result, TraceError};
use crate::ir::{Atom, Jaxpr, VarId};
use crate::np;
use crate::primitive::{self, TransposeArg};
use crate::trace::{bind, Value};
use std::collections::{HashMap, HashSet};

pub(crate) fn transpose_jaxpr(
    jaxpr: &Jaxpr,
    consts: &[Value],
    cts_out: &[Value],
) -> Result<Vec<Value>> {
    if consts.len() != jaxpr.const_binders.len() {
        return Err(TraceError::ShapeMismatch(format!(
            "transpose got {} consts for {} constant binders",
            consts.len(),
            jaxpr.const_binders.len()
        )));
    }
    if cts_out.len() != jaxpr.outs.len() {
        return Err(TraceError::ShapeMismatch(format!(
            "transpose got {} cotangents for {} outputs",
            cts_out.len(),
            jaxpr.outs.len()
        )));
    }
    for (ct, out) in cts_out.iter().zip(&jaxpr.outs) {
        if ct.shape() != out.aval().shape {
            return Err(TraceError::ShapeMismatch(format!(
                "cotangent typed {} for output typed {}",
                ct.shaped_aval(),
                out.aval()
            )));
        }
    }

    let mut linear: HashSet<VarId> =
        jaxpr.in_binders.iter().map(|v| v.id).collect();
    let mut env: HashMap<VarId, Value> = HashMap::new();
    for (binder, c) in jaxpr.const_binders.iter().zip(consts) {
        env.insert(binder.id, c.clone());
    }

    // Forward sweep: evaluate everything the linear inputs cannot reach.
    for eqn in &jaxpr.eqns {
        let touches_linear = eqn.inputs.iter().any(|a| {
            a.as_var().is_some_and(|v| linear.contains(&v.id))
        });
        if touches_linear {
            for out in &eqn.out_binders {
                linear.insert(out.id);
            }
        } else {
            let inputs = eqn
                .inputs
                .iter()
                .map(|a| read_known(&env, a))
                .collect::<Result<Vec<_>>>()?;
            let outs = bind(&eqn.prim, inputs, eqn.params.clone())?;
            for (binder, v) in eqn.out_binders.iter().zip(outs) {
                env.insert(binder.id, v);
            }
        }
    }

    // Seed output cotangents.
    let mut ct_env: HashMap<VarId, Value> = HashMap::new();
    for (atom, ct) in jaxpr.outs.iter().zip(cts_out) {
        if let Atom::Var(v) = atom {
            if linear.contains(&v.id) {
                accumulate(&mut ct_env, v.id, ct.clone())?;
            }
        }
    }

    // Backward sweep.
    for eqn in jaxpr.eqns.iter().rev() {
        if !eqn.out_binders.iter().any(|v| linear.contains(&v.id)) {
            continue;
        }
        let cts: Vec<Value> = eqn
            .out_binders
            .iter()
            .map(|v| {
                ct_env
                    .get(&v.id)
                    .cloned()
                    .unwrap_or_else(|| np::zeros(&v.aval))
            })
            .collect();
        let args: Vec<TransposeArg> = eqn
            .inputs
            .iter()
            .map(|a| match a {
                Atom::Var(v) if linear.contains(&v.id) => {
                    Ok(TransposeArg::Linear(v.aval.clone()))
                }
                other => Ok(TransposeArg::Known(read_known(&env, other)?)),
            })
            .collect::<Result<_>>()?;

        let prim = primitive::lookup(&eqn.prim)?;
        let rule = prim.transpose.ok_or_else(|| TraceError::MissingRule {
            primitive: eqn.prim.clone(),
            transform: "transpose",
        })?;
        let contributions = rule(&cts, &args, &eqn.params)?;
        if contributions.len() != eqn.inputs.len() {
            return Err(TraceError::Backend(format!(
                "transpose rule for '{}' returned {} cotangents for {} inputs",
                eqn.prim,
                contributions.len(),
                eqn.inputs.len()
            )));
        }
        for (atom, contribution) in eqn.inputs.iter().zip(contributions) {
            if let (Atom::Var(v), Some(ct)) = (atom, contribution) {
                accumulate(&mut ct_env, v.id, ct)?;
            }
        }
    }

    // Cotangents of the tangent inputs, zeros where untouched.
    Ok(jaxpr
        .in_binders
        .iter()
        .map(|v| {
            ct_env
                .get(&v.id)
                .cloned()
                .unwrap_or_else(|| np::zeros(&v.aval))
        })
        .collect())
}

fn read_known(env: &HashMap<VarId, Value>, atom: &Atom) -> Result<Value> {
    match atom {
        Atom::Var(v) => env.get(&v.id).cloned().ok_or_else(|| {
            TraceError::LevelViolation(format!(
                "binder {} has no forward value during transposition",
                v.id
            ))
        }),
        Atom::Lit(a) => Ok(Value::Concrete(a.clone())),
    }
}

fn accumulate(env: &mut HashMap<VarId, Value>, id: VarId, ct: Value) -> Result<()> {
    let next = match env.remove(&id) {
        Some(existing) => np::add(&existing, &ct)?,
        None => ct,
    };
    env.insert(id, next);
    Ok(())
}
