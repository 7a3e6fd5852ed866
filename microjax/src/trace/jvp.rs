//! The JVP trace: forward-mode differentiation.
//!
//! Tracers are (primal, tangent) pairs with matching abstract values.
//! Per-primitive rules are written in terms of the surface operations, so
//! the primal and tangent computations re-enter `bind` at the levels of the
//! values they touch; this is what makes `jvp` compose with staging and
//! batching below or above it.

use crate::aval::Aval;
use crate::error::{Result, TraceError};
use crate::primitive::{Params, Primitive};
use crate::trace::{
    push_trace, zeros_like, MainTrace, TraceKind, TracePayload, TracerPayload, Value,
};
use std::rc::Rc;

pub(crate) fn process(
    top: &Rc<MainTrace>,
    prim: &Primitive,
    args: &[Value],
    params: &Params,
) -> Result<Vec<Value>> {
    let rule = prim.jvp.ok_or_else(|| TraceError::MissingRule {
        primitive: prim.name.to_string(),
        transform: "jvp",
    })?;

    let mut primals = Vec::with_capacity(args.len());
    let mut tangents = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Tracer(t) if Rc::ptr_eq(&t.trace, top) => match &t.payload {
                TracerPayload::Jvp { primal, tangent } => {
                    primals.push(primal.clone());
                    tangents.push(tangent.clone());
                }
                other => {
                    return Err(TraceError::LevelViolation(format!(
                        "jvp trace received a foreign tracer payload {other:?}"
                    )))
                }
            },
            _ => {
                return Err(TraceError::LevelViolation(
                    "jvp trace received an unlifted value".into(),
                ))
            }
        }
    }

    let (pouts, touts) = rule(&primals, &tangents, params)?;
    if pouts.len() != touts.len() {
        return Err(TraceError::Backend(format!(
            "jvp rule for '{}' returned {} primals and {} tangents",
            prim.name,
            pouts.len(),
            touts.len()
        )));
    }
    Ok(pouts
        .into_iter()
        .zip(touts)
        .map(|(p, t)| {
            let aval = Aval::Shaped(p.shaped_aval());
            Value::tracer(top.clone(), aval, TracerPayload::Jvp { primal: p, tangent: t })
        })
        .collect())
}

/// Run `f` under a fresh JVP trace with `tangents` attached to `primals`,
/// returning the split primal and tangent outputs.
pub(crate) fn jvp_raw(
    f: &dyn Fn(&[Value]) -> Result<Vec<Value>>,
    primals: &[Value],
    tangents: &[Value],
) -> Result<(Vec<Value>, Vec<Value>)> {
    if primals.len() != tangents.len() {
        return Err(TraceError::PytreeStructureMismatch(format!(
            "jvp got {} primals and {} tangents",
            primals.len(),
            tangents.len()
        )));
    }
    for (p, t) in primals.iter().zip(tangents) {
        if p.shaped_aval() != t.shaped_aval() {
            return Err(TraceError::ShapeMismatch(format!(
                "tangent typed {} does not match primal {}",
                t.shaped_aval(),
                p.shaped_aval()
            )));
        }
    }

    let guard = push_trace(TraceKind::Jvp, TracePayload::Jvp);
    let trace = guard.trace();
    let ins: Vec<Value> = primals
        .iter()
        .zip(tangents)
        .map(|(p, t)| {
            Value::tracer(
                trace.clone(),
                Aval::Shaped(p.shaped_aval()),
                TracerPayload::Jvp {
                    primal: p.clone(),
                    tangent: t.clone(),
                },
            )
        })
        .collect();
    let outs = f(&ins)?;

    let mut pouts = Vec::with_capacity(outs.len());
    let mut touts = Vec::with_capacity(outs.len());
    for out in outs {
        match &out {
            Value::Tracer(t)
                if Rc::ptr_eq(&t.trace, &trace) =>
            {
                if let TracerPayload::Jvp { primal, tangent } = &t.payload {
                    pouts.push(primal.clone());
                    touts.push(tangent.clone());
                    continue;
                }
                return Err(TraceError::LevelViolation(
                    "jvp trace produced a foreign tracer".into(),
                ));
            }
            _ => {
                // The output never touched the inputs: zero tangent.
                touts.push(zeros_like(&out));
                pouts.push(out);
            }
        }
    }
    drop(guard);
    Ok((pouts, touts))
}
