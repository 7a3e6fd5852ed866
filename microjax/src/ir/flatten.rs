//! Jit-equation inlining.
//!
//! `flatten_jaxpr` substitutes the body of every `jit` equation in place of
//! the call, α-renaming the inner binders so identities stay unique (the
//! same sub-jaxpr may be inlined at several sites), then removes equations
//! whose outputs are never referenced.

use super::core::{Atom, Jaxpr, JaxprEqn, Var, VarId};
use std::collections::{HashMap, HashSet};

/// Inline all nested `jit` equations, recursively, and drop dead equations.
pub fn flatten_jaxpr(jaxpr: &Jaxpr) -> Jaxpr {
    let mut eqns: Vec<JaxprEqn> = Vec::new();
    // Maps a binder to the atom that replaces it after inlining.
    let mut alias: HashMap<VarId, Atom> = HashMap::new();

    let resolve = |alias: &HashMap<VarId, Atom>, atom: &Atom| -> Atom {
        match atom {
            Atom::Var(v) => alias.get(&v.id).cloned().unwrap_or_else(|| atom.clone()),
            Atom::Lit(_) => atom.clone(),
        }
    };

    for eqn in &jaxpr.eqns {
        let inputs: Vec<Atom> =
            eqn.inputs.iter().map(|a| resolve(&alias, a)).collect();
        if let ("jit", Ok(inner)) = (eqn.prim.as_str(), eqn.params.jaxpr("jaxpr")) {
            let inner = flatten_jaxpr(&inner);
            // Bind the inner inputs (consts are the leading equation inputs)
            // to the call-site atoms.
            let mut subst: HashMap<VarId, Atom> = HashMap::new();
            for (binder, atom) in inner.in_binders.iter().zip(&inputs) {
                subst.insert(binder.id, atom.clone());
            }
            for inner_eqn in &inner.eqns {
                let new_inputs: Vec<Atom> = inner_eqn
                    .inputs
                    .iter()
                    .map(|a| resolve(&subst, a))
                    .collect();
                let new_outs: Vec<Var> = inner_eqn
                    .out_binders
                    .iter()
                    .map(|v| {
                        let fresh = Var::fresh(v.aval.clone());
                        subst.insert(v.id, Atom::Var(fresh.clone()));
                        fresh
                    })
                    .collect();
                eqns.push(JaxprEqn {
                    prim: inner_eqn.prim.clone(),
                    inputs: new_inputs,
                    params: inner_eqn.params.clone(),
                    out_binders: new_outs,
                });
            }
            for (call_out, inner_out) in
                eqn.out_binders.iter().zip(&inner.outs)
            {
                alias.insert(call_out.id, resolve(&subst, inner_out));
            }
        } else {
            eqns.push(JaxprEqn {
                prim: eqn.prim.clone(),
                inputs,
                params: eqn.params.clone(),
                out_binders: eqn.out_binders.clone(),
            });
        }
    }

    let outs: Vec<Atom> = jaxpr.outs.iter().map(|a| resolve(&alias, a)).collect();
    let eqns = eliminate_dead(eqns, &outs);
    Jaxpr {
        const_binders: jaxpr.const_binders.clone(),
        in_binders: jaxpr.in_binders.clone(),
        eqns,
        outs,
    }
}

/// Drop equations none of whose outputs are referenced downstream.
fn eliminate_dead(eqns: Vec<JaxprEqn>, outs: &[Atom]) -> Vec<JaxprEqn> {
    let mut live: HashSet<VarId> = outs
        .iter()
        .filter_map(|a| a.as_var().map(|v| v.id))
        .collect();
    let mut keep = vec![false; eqns.len()];
    for (i, eqn) in eqns.iter().enumerate().rev() {
        if eqn.out_binders.iter().any(|v| live.contains(&v.id)) {
            keep[i] = true;
            for atom in &eqn.inputs {
                if let Atom::Var(v) = atom {
                    live.insert(v.id);
                }
            }
        }
    }
    eqns.into_iter()
        .zip(keep)
        .filter_map(|(e, k)| k.then_some(e))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aval::ShapedArray;
    use crate::dtype::DType;
    use crate::primitive::{ParamValue, Params};
    use std::rc::Rc;

    fn scalar_aval() -> ShapedArray {
        ShapedArray::scalar(DType::F32)
    }

    #[test]
    fn inlines_jit_equations_and_renames_binders() {
        // inner: { lambda a . let b = mul a a in ( b ) }
        let ia = Var::fresh(scalar_aval());
        let ib = Var::fresh(scalar_aval());
        let inner = Jaxpr {
            const_binders: vec![],
            in_binders: vec![ia.clone()],
            eqns: vec![JaxprEqn {
                prim: "mul".into(),
                inputs: vec![Atom::Var(ia.clone()), Atom::Var(ia)],
                params: Params::new(),
                out_binders: vec![ib.clone()],
            }],
            outs: vec![Atom::Var(ib)],
        };

        // outer calls the same sub-jaxpr twice.
        let oa = Var::fresh(scalar_aval());
        let o1 = Var::fresh(scalar_aval());
        let o2 = Var::fresh(scalar_aval());
        let params = Params::new()
            .with("jaxpr", ParamValue::Jaxpr(Rc::new(inner)))
            .with("name", ParamValue::Str("f".into()))
            .with("num_consts", ParamValue::Int(0));
        let outer = Jaxpr {
            const_binders: vec![],
            in_binders: vec![oa.clone()],
            eqns: vec![
                JaxprEqn {
                    prim: "jit".into(),
                    inputs: vec![Atom::Var(oa.clone())],
                    params: params.clone(),
                    out_binders: vec![o1.clone()],
                },
                JaxprEqn {
                    prim: "jit".into(),
                    inputs: vec![Atom::Var(o1.clone())],
                    params,
                    out_binders: vec![o2.clone()],
                },
            ],
            outs: vec![Atom::Var(o2)],
        };

        let flat = flatten_jaxpr(&outer);
        assert_eq!(flat.eqns.len(), 2);
        assert!(flat.eqns.iter().all(|e| e.prim == "mul"));
        // α-renaming keeps binder identities unique across the two sites.
        let ids: Vec<_> = flat
            .eqns
            .iter()
            .flat_map(|e| e.out_binders.iter().map(|v| v.id))
            .collect();
        assert_ne!(ids[0], ids[1]);
        flat.typecheck().unwrap();
    }

    #[test]
    fn dead_equations_are_removed() {
        let a = Var::fresh(scalar_aval());
        let dead = Var::fresh(scalar_aval());
        let live = Var::fresh(scalar_aval());
        let jaxpr = Jaxpr {
            const_binders: vec![],
            in_binders: vec![a.clone()],
            eqns: vec![
                JaxprEqn {
                    prim: "neg".into(),
                    inputs: vec![Atom::Var(a.clone())],
                    params: Params::new(),
                    out_binders: vec![dead],
                },
                JaxprEqn {
                    prim: "mul".into(),
                    inputs: vec![Atom::Var(a.clone()), Atom::Var(a)],
                    params: Params::new(),
                    out_binders: vec![live.clone()],
                },
            ],
            outs: vec![Atom::Var(live)],
        };
        let flat = flatten_jaxpr(&jaxpr);
        assert_eq!(flat.eqns.len(), 1);
        assert_eq!(flat.eqns[0].prim, "mul");
    }
}
