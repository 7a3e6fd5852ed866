//! The eager trace: always at the bottom of the stack, never stages.
//!
//! Concrete inputs are handed to the backend's `impl` table; the `jit`
//! primitive is the one higher-order exception and evaluates its sub-jaxpr
//! equation by equation (which re-enters `bind`).

use crate::array::ArrayRef;
use crate::backend;
use crate::error::{Result, TraceError};
use crate::ir::eval_jaxpr;
use crate::primitive::{Params, Primitive};
use crate::trace::Value;

pub(crate) fn process(
    prim: &Primitive,
    args: &[Value],
    params: &Params,
) -> Result<Vec<Value>> {
    let concrete: Vec<ArrayRef> = args
        .iter()
        .map(|a| {
            a.as_concrete().cloned().ok_or_else(|| {
                TraceError::LevelViolation(format!(
                    "eager evaluation of '{}' received a tracer",
                    prim.name
                ))
            })
        })
        .collect::<Result<_>>()?;
    let outs = exec(prim.name, &concrete, params)?;
    Ok(outs.into_iter().map(Value::Concrete).collect())
}

/// Execute a primitive on concrete buffers. Also used by the jaxpr trace
/// for constant folding.
pub(crate) fn exec(
    name: &str,
    args: &[ArrayRef],
    params: &Params,
) -> Result<Vec<ArrayRef>> {
    if name == "jit" {
        let jaxpr = params.jaxpr("jaxpr")?;
        let vals: Vec<Value> = args.iter().map(|a| Value::Concrete(a.clone())).collect();
        let outs = eval_jaxpr(&jaxpr, &[], &vals)?;
        return outs
            .into_iter()
            .map(|v| {
                v.as_concrete().cloned().ok_or_else(|| {
                    TraceError::LevelViolation(
                        "jit evaluation of concrete inputs produced a tracer".into(),
                    )
                })
            })
            .collect();
    }
    let impl_fn = backend::lookup_impl(name)?;
    impl_fn(args, params)
}
