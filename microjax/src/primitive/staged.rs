//! Rules for the higher-order `jit` primitive.
//!
//! A `jit` equation carries its sub-jaxpr (with captured constants folded
//! into the first `num_consts` inputs). Under differentiation or batching
//! the sub-jaxpr is evaluated through `bind`, which re-enters the ambient
//! traces equation by equation; under staging and eager evaluation the
//! call stays nested (see the jaxpr trace and the eager interpreter).

use super::{Params, Primitive};
use crate::aval::ShapedArray;
use crate::error::{Result, TraceError};
use crate::ir::eval_jaxpr;
use crate::trace::{batch::batch_raw, jvp::jvp_raw, Value};

pub(super) fn register_all() {
    super::register_primitive(Primitive {
        name: "jit",
        abstract_eval: jit_abstract,
        jvp: Some(jit_jvp),
        transpose: None,
        batch: Some(jit_batch),
        linear_inputs: &[],
    });
}

fn jit_abstract(ins: &[ShapedArray], params: &Params) -> Result<Vec<ShapedArray>> {
    let jaxpr = params.jaxpr("jaxpr")?;
    if ins.len() != jaxpr.in_binders.len() {
        return Err(TraceError::ShapeMismatch(format!(
            "jit call with {} inputs for a jaxpr of {}",
            ins.len(),
            jaxpr.in_binders.len()
        )));
    }
    for (aval, binder) in ins.iter().zip(&jaxpr.in_binders) {
        if aval != &binder.aval {
            return Err(TraceError::ShapeMismatch(format!(
                "jit call input typed {aval} where the jaxpr expects {}",
                binder.aval
            )));
        }
    }
    Ok(jaxpr.out_avals())
}

fn jit_jvp(p: &[Value], t: &[Value], params: &Params) -> Result<(Vec<Value>, Vec<Value>)> {
    let jaxpr = params.jaxpr("jaxpr")?;
    let f = move |xs: &[Value]| eval_jaxpr(&jaxpr, &[], xs);
    jvp_raw(&f, p, t)
}

fn jit_batch(
    vals: &[Value],
    dims: &[Option<usize>],
    axis_size: usize,
    params: &Params,
) -> Result<(Vec<Value>, Vec<Option<usize>>)> {
    let jaxpr = params.jaxpr("jaxpr")?;
    let f = move |xs: &[Value]| eval_jaxpr(&jaxpr, &[], xs);
    batch_raw(&f, vals, dims, axis_size)
}
