//! Canonical text form of jaxprs.
//!
//! The rendering is a golden artefact: tests compare it character by
//! character, so every choice here is frozen. Binders are named `a, b, c,
//! ... z, aa, ab, ...` in definition order (constants first, then inputs,
//! then equation outputs); dtypes use their short names; scalar literals
//! print bare.

use super::core::{Atom, Jaxpr, JaxprEqn, VarId};
use crate::array::{ArrayData, ArrayValue};
use crate::primitive::ParamValue;
use std::collections::HashMap;
use std::fmt;

impl fmt::Display for Jaxpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&pretty_jaxpr(self))
    }
}

/// Render a jaxpr in the canonical text form.
pub fn pretty_jaxpr(jaxpr: &Jaxpr) -> String {
    let names = assign_names(jaxpr);

    let binder = |v: &super::core::Var| format!("{}:{}", names[&v.id], v.aval);
    let consts: Vec<String> = jaxpr.const_binders.iter().map(binder).collect();
    let ins: Vec<String> = jaxpr.in_binders.iter().map(binder).collect();

    let mut header = String::from("{ lambda");
    if !consts.is_empty() {
        header.push(' ');
        header.push_str(&consts.join(" "));
        header.push_str(" ;");
    }
    if !ins.is_empty() {
        header.push(' ');
        header.push_str(&ins.join(" "));
    }
    header.push_str(" .");

    let outs: Vec<String> = jaxpr
        .outs
        .iter()
        .map(|a| render_atom(a, &names))
        .collect();
    let outs = if outs.is_empty() {
        "( )".to_string()
    } else {
        format!("( {} )", outs.join(" "))
    };

    if jaxpr.eqns.is_empty() {
        return format!("{header} {outs} }}");
    }

    let mut lines = vec![header];
    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        let prefix = if i == 0 { "  let " } else { "      " };
        lines.push(format!("{prefix}{}", render_eqn(eqn, &names)));
    }
    lines.push(format!("  in {outs} }}"));
    lines.join("\n")
}

fn render_eqn(eqn: &JaxprEqn, names: &HashMap<VarId, String>) -> String {
    let lhs: Vec<String> = eqn
        .out_binders
        .iter()
        .map(|v| format!("{}:{}", names[&v.id], v.aval))
        .collect();
    let mut s = format!("{} = {}", lhs.join(" "), eqn.prim);

    let inline: Vec<String> = eqn
        .params
        .0
        .iter()
        .filter(|(_, v)| !matches!(v, ParamValue::Jaxpr(_)))
        .map(|(k, v)| format!("{k}={}", render_param(v)))
        .collect();
    let nested: Vec<(&String, &ParamValue)> = eqn
        .params
        .0
        .iter()
        .filter(|(_, v)| matches!(v, ParamValue::Jaxpr(_)))
        .collect();
    if !inline.is_empty() || !nested.is_empty() {
        s.push('[');
        s.push_str(&inline.join(", "));
        for (k, v) in nested {
            if let ParamValue::Jaxpr(j) = v {
                if !s.ends_with('[') {
                    s.push(',');
                }
                s.push_str("\n        ");
                s.push_str(k);
                s.push('=');
                s.push_str(&indent_after_first(&pretty_jaxpr(j), 10));
            }
        }
        s.push(']');
    }

    for input in &eqn.inputs {
        s.push(' ');
        s.push_str(&render_atom(input, names));
    }
    s
}

fn indent_after_first(text: &str, indent: usize) -> String {
    let pad = " ".repeat(indent);
    let mut out = String::new();
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
            out.push_str(&pad);
        }
        out.push_str(line);
    }
    out
}

fn render_param(v: &ParamValue) -> String {
    match v {
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Str(s) => s.clone(),
        ParamValue::DType(d) => d.to_string(),
        ParamValue::Axes(a) => render_usize_list(a),
        ParamValue::Shape(s) => render_usize_list(s),
        ParamValue::Jaxpr(_) => unreachable!("nested jaxprs render separately"),
    }
}

fn render_usize_list(xs: &[usize]) -> String {
    let parts: Vec<String> = xs.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn render_atom(atom: &Atom, names: &HashMap<VarId, String>) -> String {
    match atom {
        Atom::Var(v) => names
            .get(&v.id)
            .cloned()
            .unwrap_or_else(|| format!("?{}", v.id)),
        Atom::Lit(a) => render_literal(a),
    }
}

fn render_literal(a: &ArrayValue) -> String {
    if !a.is_scalar() {
        return format!("array({})", a.aval());
    }
    match a.data() {
        ArrayData::Bool(v) => v[0].to_string(),
        ArrayData::I32(v) => v[0].to_string(),
        ArrayData::I64(v) => v[0].to_string(),
        ArrayData::F16(v) => v[0].to_string(),
        ArrayData::F32(v) => v[0].to_string(),
        ArrayData::F64(v) => v[0].to_string(),
        ArrayData::C64(v) => v[0].to_string(),
    }
}

fn assign_names(jaxpr: &Jaxpr) -> HashMap<VarId, String> {
    let mut names = HashMap::new();
    let mut next = 0usize;
    let mut assign = |names: &mut HashMap<VarId, String>, id: VarId| {
        names.entry(id).or_insert_with(|| {
            let label = var_label(next);
            next += 1;
            label
        });
    };
    for v in &jaxpr.const_binders {
        assign(&mut names, v.id);
    }
    for v in &jaxpr.in_binders {
        assign(&mut names, v.id);
    }
    for eqn in &jaxpr.eqns {
        for v in &eqn.out_binders {
            assign(&mut names, v.id);
        }
    }
    names
}

/// `0 -> a`, `25 -> z`, `26 -> aa`, ...
fn var_label(mut i: usize) -> String {
    let mut bytes = Vec::new();
    loop {
        bytes.push(b'a' + (i % 26) as u8);
        if i < 26 {
            break;
        }
        i = i / 26 - 1;
    }
    bytes.reverse();
    String::from_utf8(bytes).expect("ascii labels")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aval::ShapedArray;
    use crate::dtype::DType;
    use crate::ir::{JaxprEqn, Var};
    use crate::primitive::Params;
    use std::rc::Rc;

    #[test]
    fn labels_roll_over_past_z() {
        assert_eq!(var_label(0), "a");
        assert_eq!(var_label(25), "z");
        assert_eq!(var_label(26), "aa");
        assert_eq!(var_label(27), "ab");
    }

    #[test]
    fn constant_only_jaxpr_prints_on_one_line() {
        let jaxpr = Jaxpr {
            const_binders: vec![],
            in_binders: vec![],
            eqns: vec![],
            outs: vec![Atom::Lit(Rc::new(ArrayValue::from_scalar(
                4.0,
                DType::I64,
            )))],
        };
        assert_eq!(pretty_jaxpr(&jaxpr), "{ lambda . ( 4 ) }");
    }

    #[test]
    fn let_block_renders_in_definition_order() {
        let aval = ShapedArray::new(vec![2, 3], DType::F32);
        let a = Var::fresh(aval.clone());
        let b = Var::fresh(aval.clone());
        let c = Var::fresh(aval.clone());
        let two = Rc::new(ArrayValue::from_scalar(2.0, DType::F32));
        let jaxpr = Jaxpr {
            const_binders: vec![],
            in_binders: vec![a.clone()],
            eqns: vec![
                JaxprEqn {
                    prim: "add".into(),
                    inputs: vec![Atom::Var(a.clone()), Atom::Lit(two)],
                    params: Params::new(),
                    out_binders: vec![b.clone()],
                },
                JaxprEqn {
                    prim: "mul".into(),
                    inputs: vec![Atom::Var(b), Atom::Var(a)],
                    params: Params::new(),
                    out_binders: vec![c.clone()],
                },
            ],
            outs: vec![Atom::Var(c)],
        };
        let expected = "\
{ lambda a:f32[2,3] .
  let b:f32[2,3] = add a 2
      c:f32[2,3] = mul b a
  in ( c ) }";
        assert_eq!(pretty_jaxpr(&jaxpr), expected);
    }

    #[test]
    fn constvars_print_before_the_separator() {
        let a = Var::fresh(ShapedArray::new(vec![2], DType::F32));
        let b = Var::fresh(ShapedArray::new(vec![2], DType::F32));
        let c = Var::fresh(ShapedArray::new(vec![2], DType::F32));
        let jaxpr = Jaxpr {
            const_binders: vec![a.clone()],
            in_binders: vec![b.clone()],
            eqns: vec![JaxprEqn {
                prim: "mul".into(),
                inputs: vec![Atom::Var(a), Atom::Var(b)],
                params: Params::new(),
                out_binders: vec![c.clone()],
            }],
            outs: vec![Atom::Var(c)],
        };
        let expected = "\
{ lambda a:f32[2] ; b:f32[2] .
  let c:f32[2] = mul a b
  in ( c ) }";
        assert_eq!(pretty_jaxpr(&jaxpr), expected);
    }

    #[test]
    fn params_render_sorted_in_brackets() {
        let a = Var::fresh(ShapedArray::new(vec![2, 3], DType::F32));
        let b = Var::fresh(ShapedArray::scalar(DType::F32));
        let jaxpr = Jaxpr {
            const_binders: vec![],
            in_binders: vec![a.clone()],
            eqns: vec![JaxprEqn {
                prim: "reduce_sum".into(),
                inputs: vec![Atom::Var(a)],
                params: Params::new()
                    .with("axes", crate::primitive::ParamValue::Axes(vec![0, 1])),
                out_binders: vec![b.clone()],
            }],
            outs: vec![Atom::Var(b)],
        };
        let expected = "\
{ lambda a:f32[2,3] .
  let b:f32[] = reduce_sum[axes=[0, 1]] a
  in ( b ) }";
        assert_eq!(pretty_jaxpr(&jaxpr), expected);
    }
}
