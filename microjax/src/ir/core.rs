//! Core IR structures.
//!
//! A jaxpr is an SSA-style typed program: constant binders, input binders,
//! a list of equations, and output atoms. Binder identities are
//! program-unique (a thread-local counter); readable names are assigned
//! only when printing.

use crate::array::ArrayRef;
use crate::aval::ShapedArray;
use crate::error::{Result, TraceError};
use crate::primitive::{self, Params};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;

/// Program-unique identity of a binder.
pub type VarId = u64;

thread_local! {
    static NEXT_VAR: Cell<VarId> = const { Cell::new(0) };
}

/// An SSA binder with its abstract value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Var {
    pub id: VarId,
    pub aval: ShapedArray,
}

impl Var {
    /// Allocate a binder with a fresh program-unique identity.
    pub fn fresh(aval: ShapedArray) -> Var {
        let id = NEXT_VAR.with(|c| {
            let id = c.get();
            c.set(id + 1);
            id
        });
        Var { id, aval }
    }
}

/// An equation input or program output: a binder or a literal constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Atom {
    Var(Var),
    Lit(ArrayRef),
}

impl Atom {
    pub fn aval(&self) -> ShapedArray {
        match self {
            Atom::Var(v) => v.aval.clone(),
            Atom::Lit(a) => a.aval(),
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Atom::Var(v) => Some(v),
            Atom::Lit(_) => None,
        }
    }
}

/// One IR statement: `out_binders = prim[params] inputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JaxprEqn {
    pub prim: String,
    pub inputs: Vec<Atom>,
    pub params: Params,
    pub out_binders: Vec<Var>,
}

/// A typed program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jaxpr {
    pub const_binders: Vec<Var>,
    pub in_binders: Vec<Var>,
    pub eqns: Vec<JaxprEqn>,
    pub outs: Vec<Atom>,
}

impl Jaxpr {
    pub fn in_avals(&self) -> Vec<ShapedArray> {
        self.in_binders.iter().map(|v| v.aval.clone()).collect()
    }

    pub fn out_avals(&self) -> Vec<ShapedArray> {
        self.outs.iter().map(Atom::aval).collect()
    }

    /// Fold the constant binders into leading input binders, returning the
    /// rewritten program and the number of folded binders. This is the form
    /// carried by `jit` equations (`num_consts` leading inputs).
    pub fn consts_to_invars(&self) -> (Jaxpr, usize) {
        let num_consts = self.const_binders.len();
        let mut in_binders =
            Vec::with_capacity(num_consts + self.in_binders.len());
        in_binders.extend(self.const_binders.iter().cloned());
        in_binders.extend(self.in_binders.iter().cloned());
        (
            Jaxpr {
                const_binders: Vec::new(),
                in_binders,
                eqns: self.eqns.clone(),
                outs: self.outs.clone(),
            },
            num_consts,
        )
    }

    /// Check the structural invariants: binders defined before use, unique
    /// binder identities, and per-equation output avals agreeing with the
    /// primitive's abstract evaluation.
    pub fn typecheck(&self) -> Result<()> {
        let mut defined: HashSet<VarId> = HashSet::new();
        for v in self.const_binders.iter().chain(&self.in_binders) {
            if !defined.insert(v.id) {
                return Err(TraceError::LevelViolation(format!(
                    "duplicate binder id {} in jaxpr signature",
                    v.id
                )));
            }
        }
        for eqn in &self.eqns {
            for atom in &eqn.inputs {
                if let Atom::Var(v) = atom {
                    if !defined.contains(&v.id) {
                        return Err(TraceError::LevelViolation(format!(
                            "binder {} used before definition",
                            v.id
                        )));
                    }
                }
            }
            let prim = primitive::lookup(&eqn.prim)?;
            let in_avals: Vec<ShapedArray> =
                eqn.inputs.iter().map(Atom::aval).collect();
            let out_avals = (prim.abstract_eval)(&in_avals, &eqn.params)?;
            if out_avals.len() != eqn.out_binders.len() {
                return Err(TraceError::ShapeMismatch(format!(
                    "'{}' produces {} outputs, equation binds {}",
                    eqn.prim,
                    out_avals.len(),
                    eqn.out_binders.len()
                )));
            }
            for (binder, aval) in eqn.out_binders.iter().zip(&out_avals) {
                if &binder.aval != aval {
                    return Err(TraceError::ShapeMismatch(format!(
                        "'{}' output typed {} but bound as {}",
                        eqn.prim, aval, binder.aval
                    )));
                }
                if !defined.insert(binder.id) {
                    return Err(TraceError::LevelViolation(format!(
                        "duplicate binder id {}",
                        binder.id
                    )));
                }
            }
        }
        for atom in &self.outs {
            if let Atom::Var(v) = atom {
                if !defined.contains(&v.id) {
                    return Err(TraceError::LevelViolation(format!(
                        "output binder {} is unbound",
                        v.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A jaxpr together with the concrete constants captured at trace time,
/// one per constant binder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedJaxpr {
    pub jaxpr: Rc<Jaxpr>,
    pub consts: Vec<ArrayRef>,
}

impl ClosedJaxpr {
    pub fn new(jaxpr: Jaxpr, consts: Vec<ArrayRef>) -> ClosedJaxpr {
        ClosedJaxpr {
            jaxpr: Rc::new(jaxpr),
            consts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayValue;
    use crate::dtype::DType;

    fn scalar_aval() -> ShapedArray {
        ShapedArray::scalar(DType::F32)
    }

    #[test]
    fn fresh_binders_have_unique_identities() {
        let a = Var::fresh(scalar_aval());
        let b = Var::fresh(scalar_aval());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn typecheck_rejects_out_of_scope_binders() {
        let a = Var::fresh(scalar_aval());
        let ghost = Var::fresh(scalar_aval());
        let out = Var::fresh(scalar_aval());
        let jaxpr = Jaxpr {
            const_binders: vec![],
            in_binders: vec![a],
            eqns: vec![JaxprEqn {
                prim: "neg".into(),
                inputs: vec![Atom::Var(ghost)],
                params: Params::new(),
                out_binders: vec![out.clone()],
            }],
            outs: vec![Atom::Var(out)],
        };
        assert!(jaxpr.typecheck().is_err());
    }

    #[test]
    fn typecheck_compares_against_abstract_evaluation() {
        let a = Var::fresh(scalar_aval());
        let wrong = Var::fresh(ShapedArray::new(vec![2], DType::F32));
        let jaxpr = Jaxpr {
            const_binders: vec![],
            in_binders: vec![a.clone()],
            eqns: vec![JaxprEqn {
                prim: "neg".into(),
                inputs: vec![Atom::Var(a)],
                params: Params::new(),
                out_binders: vec![wrong.clone()],
            }],
            outs: vec![Atom::Var(wrong)],
        };
        assert!(jaxpr.typecheck().is_err());
    }

    #[test]
    fn programs_round_trip_through_serde() {
        let a = Var::fresh(scalar_aval());
        let b = Var::fresh(scalar_aval());
        let jaxpr = Jaxpr {
            const_binders: vec![],
            in_binders: vec![a.clone()],
            eqns: vec![JaxprEqn {
                prim: "mul".into(),
                inputs: vec![
                    Atom::Var(a),
                    Atom::Lit(Rc::new(ArrayValue::from_scalar(2.0, DType::F32))),
                ],
                params: Params::new(),
                out_binders: vec![b.clone()],
            }],
            outs: vec![Atom::Var(b)],
        };
        let closed = ClosedJaxpr::new(jaxpr, vec![]);
        let json = serde_json::to_string(&closed).expect("serializable");
        let back: ClosedJaxpr = serde_json::from_str(&json).expect("deserializable");
        assert_eq!(closed, back);
    }
}
