//! User-facing transformations.
//!
//! Every transformation is defined over flat lists of values internally;
//! the pytree layer here flattens arguments, wraps the user function so
//! its output structure is captured (and checked between calls), and
//! unflattens results. User functions take one [`Tree`] per formal
//! argument and return a single tree.

use crate::aval::ShapedArray;
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use crate::ir::{ClosedJaxpr, Jaxpr};
use crate::np;
use crate::pytree::{flatten, unflatten, Tree, TreeDef};
use crate::trace::{batch, jvp as jvp_trace, partial, Value};
use crate::transpose::transpose_jaxpr;
use std::cell::RefCell;

/// A user function under transformation: one tree per formal argument in,
/// one tree out.
pub type TreeFn<'a> = dyn Fn(&[Tree]) -> Result<Tree> + 'a;

/// Options shared by the differentiation transformations.
#[derive(Debug, Clone, Default)]
pub struct GradOptions {
    /// The function returns a `(main, aux)` pair; `aux` is traced but not
    /// differentiated.
    pub has_aux: bool,
    /// Argument positions to differentiate with respect to; empty means
    /// the first argument.
    pub argnums: Vec<usize>,
    /// Allow complex-valued outputs (holomorphic differentiation).
    pub holomorphic: bool,
}

fn flatten_args(args: &[Tree]) -> Result<(Vec<Value>, TreeDef)> {
    flatten(&Tree::List(args.to_vec()))
}

fn unflatten_args(def: &TreeDef, leaves: &[Value]) -> Result<Vec<Tree>> {
    match unflatten(def, leaves)? {
        Tree::List(trees) => Ok(trees),
        _ => Err(TraceError::PytreeStructureMismatch(
            "argument structure is not a list".into(),
        )),
    }
}

/// Adapter from a tree function to a flat function, capturing the output
/// structure and checking it stays fixed across calls.
struct FlatFun<'a> {
    f: &'a TreeFn<'a>,
    in_def: TreeDef,
    out_def: RefCell<Option<TreeDef>>,
}

impl<'a> FlatFun<'a> {
    fn new(f: &'a TreeFn<'a>, in_def: TreeDef) -> FlatFun<'a> {
        FlatFun {
            f,
            in_def,
            out_def: RefCell::new(None),
        }
    }

    fn call(&self, leaves: &[Value]) -> Result<Vec<Value>> {
        let args = unflatten_args(&self.in_def, leaves)?;
        let out = (self.f)(&args)?;
        let (out_leaves, out_def) = flatten(&out)?;
        let mut slot = self.out_def.borrow_mut();
        match &*slot {
            None => *slot = Some(out_def),
            Some(prev) if *prev == out_def => {}
            Some(_) => {
                return Err(TraceError::PytreeStructureMismatch(
                    "function returned a different structure than before".into(),
                ))
            }
        }
        Ok(out_leaves)
    }

    fn out_def(&self) -> Result<TreeDef> {
        self.out_def.borrow().clone().ok_or_else(|| {
            TraceError::PytreeStructureMismatch(
                "function was never called during tracing".into(),
            )
        })
    }
}

/// Trace `f` on example arguments to a closed jaxpr, plus the structure of
/// its output. The jaxpr is deterministic for a given input structure and
/// abstract signature.
pub fn make_jaxpr(f: &TreeFn, examples: &[Tree]) -> Result<(ClosedJaxpr, TreeDef)> {
    let (leaves, in_def) = flatten_args(examples)?;
    let avals: Vec<ShapedArray> = leaves.iter().map(Value::shaped_aval).collect();
    let flat = FlatFun::new(f, in_def);
    let (jaxpr, const_vals) =
        partial::trace_to_jaxpr(&|vals: &[Value]| flat.call(vals), &avals)?;
    let consts = const_vals
        .iter()
        .map(|v| {
            v.as_concrete().cloned().ok_or_else(|| {
                TraceError::LevelViolation(
                    "traced function closed over a live tracer".into(),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((ClosedJaxpr::new(jaxpr, consts), flat.out_def()?))
}

/// Forward-mode differentiation: the primal outputs and the directional
/// derivatives along `tangents`.
pub fn jvp(f: &TreeFn, primals: &[Tree], tangents: &[Tree]) -> Result<(Tree, Tree)> {
    let (pleaves, in_def) = flatten_args(primals)?;
    let (tleaves, tan_def) = flatten_args(tangents)?;
    if in_def != tan_def {
        return Err(TraceError::PytreeStructureMismatch(
            "tangent structure does not match primal structure".into(),
        ));
    }
    let flat = FlatFun::new(f, in_def);
    let (pouts, touts) =
        jvp_trace::jvp_raw(&|vals: &[Value]| flat.call(vals), &pleaves, &tleaves)?;
    let out_def = flat.out_def()?;
    Ok((unflatten(&out_def, &pouts)?, unflatten(&out_def, &touts)?))
}

/// A linear map captured as a jaxpr over tangent inputs.
#[derive(Debug)]
pub struct LinearMap {
    jaxpr: Jaxpr,
    consts: Vec<Value>,
    in_def: TreeDef,
    out_def: TreeDef,
}

impl LinearMap {
    /// Apply the linear map to tangents shaped like the primal arguments.
    pub fn apply(&self, tangents: &[Tree]) -> Result<Tree> {
        let (leaves, def) = flatten_args(tangents)?;
        if def != self.in_def {
            return Err(TraceError::PytreeStructureMismatch(
                "tangent structure does not match the linearization point".into(),
            ));
        }
        let outs = crate::ir::eval_jaxpr(&self.jaxpr, &self.consts, &leaves)?;
        unflatten(&self.out_def, &outs)
    }

    /// The captured linear program (tests inspect its text form).
    pub fn jaxpr(&self) -> &Jaxpr {
        &self.jaxpr
    }
}

fn linearize_flat(
    f: &dyn Fn(&[Value]) -> Result<Vec<Value>>,
    primals: &[Value],
) -> Result<(Vec<Value>, Jaxpr, Vec<Value>)> {
    let avals: Vec<ShapedArray> = primals.iter().map(Value::shaped_aval).collect();
    let (guard, builder, tangent_ins) = partial::open_trace(&avals);
    let trace = guard.trace();
    let (pouts, touts) = jvp_trace::jvp_raw(f, primals, &tangent_ins)?;
    let jaxpr = partial::finish(&builder, &trace, &touts);
    drop(guard);
    jaxpr.typecheck()?;
    let consts = partial::const_vals(&builder);
    Ok((pouts, jaxpr, consts))
}

/// Linearize `f` at `primals`: the primal output plus the best linear
/// approximation as a reusable jaxpr.
pub fn linearize(f: &TreeFn, primals: &[Tree]) -> Result<(Tree, LinearMap)> {
    let (pleaves, in_def) = flatten_args(primals)?;
    let flat = FlatFun::new(f, in_def.clone());
    let (pouts, jaxpr, consts) =
        linearize_flat(&|vals: &[Value]| flat.call(vals), &pleaves)?;
    let out_def = flat.out_def()?;
    let primal_out = unflatten(&out_def, &pouts)?;
    Ok((
        primal_out,
        LinearMap {
            jaxpr,
            consts,
            in_def,
            out_def,
        },
    ))
}

/// The backward function returned by [`vjp`]: maps output cotangents to
/// input cotangents by transposing the linearized program.
#[derive(Debug)]
pub struct VjpBackward {
    jaxpr: Jaxpr,
    consts: Vec<Value>,
    in_def: TreeDef,
    out_def: TreeDef,
}

impl VjpBackward {
    /// Pull a cotangent of the output back to cotangents of the arguments,
    /// one tree per formal argument.
    pub fn call(&self, cotangent: &Tree) -> Result<Vec<Tree>> {
        let (cts, def) = flatten(cotangent)?;
        if def != self.out_def {
            return Err(TraceError::PytreeStructureMismatch(
                "cotangent structure does not match the function output".into(),
            ));
        }
        let ct_ins = transpose_jaxpr(&self.jaxpr, &self.consts, &cts)?;
        unflatten_args(&self.in_def, &ct_ins)
    }
}

/// Reverse-mode linearization: primal output and the backward function.
pub fn vjp(f: &TreeFn, primals: &[Tree]) -> Result<(Tree, VjpBackward)> {
    let (out, backward, _) = vjp_impl(f, primals, false)?;
    Ok((out, backward))
}

/// [`vjp`] for functions returning a `(main, aux)` pair: `aux` is traced
/// but not differentiated, and its primal value is returned alongside.
pub fn vjp_with_aux(f: &TreeFn, primals: &[Tree]) -> Result<(Tree, VjpBackward, Tree)> {
    let (out, backward, aux) = vjp_impl(f, primals, true)?;
    let aux = aux.ok_or_else(|| {
        TraceError::PytreeStructureMismatch(
            "has_aux requires the function to return a (main, aux) pair".into(),
        )
    })?;
    Ok((out, backward, aux))
}

fn vjp_impl(
    f: &TreeFn,
    primals: &[Tree],
    has_aux: bool,
) -> Result<(Tree, VjpBackward, Option<Tree>)> {
    let (pleaves, in_def) = flatten_args(primals)?;
    let flat = FlatFun::new(f, in_def.clone());
    let (pouts, mut jaxpr, consts) =
        linearize_flat(&|vals: &[Value]| flat.call(vals), &pleaves)?;
    let full_out_def = flat.out_def()?;

    let (main_def, aux) = if has_aux {
        let (main_def, aux_def) = split_pair_def(&full_out_def)?;
        let main_count = main_def.leaf_count();
        // Auxiliary outputs are not differentiated: drop their tangents.
        jaxpr.outs.truncate(main_count);
        let aux_tree = unflatten(&aux_def, &pouts[main_count..])?;
        (main_def, Some(aux_tree))
    } else {
        (full_out_def, None)
    };

    let main_count = main_def.leaf_count();
    let primal_out = unflatten(&main_def, &pouts[..main_count])?;
    Ok((
        primal_out,
        VjpBackward {
            jaxpr,
            consts,
            in_def,
            out_def: main_def,
        },
        aux,
    ))
}

/// Split the treedef of a `(main, aux)` pair.
fn split_pair_def(def: &TreeDef) -> Result<(TreeDef, TreeDef)> {
    match def {
        TreeDef::List(children) if children.len() == 2 => {
            Ok((children[0].clone(), children[1].clone()))
        }
        _ => Err(TraceError::PytreeStructureMismatch(
            "has_aux requires the function to return a (main, aux) pair".into(),
        )),
    }
}

/// The gradient of a scalar-valued function at `args`.
pub fn grad(f: &TreeFn, args: &[Tree], opts: &GradOptions) -> Result<Tree> {
    Ok(grad_parts(f, args, opts)?.1)
}

/// Gradient plus auxiliary output (`opts.has_aux` implied).
pub fn grad_with_aux(f: &TreeFn, args: &[Tree], opts: &GradOptions) -> Result<(Tree, Tree)> {
    let mut opts = opts.clone();
    opts.has_aux = true;
    let (_, grads, aux) = grad_parts(f, args, &opts)?;
    let aux = aux.ok_or_else(|| {
        TraceError::PytreeStructureMismatch(
            "has_aux requires the function to return a (main, aux) pair".into(),
        )
    })?;
    Ok((grads, aux))
}

/// The value and the gradient in one pass.
pub fn value_and_grad(f: &TreeFn, args: &[Tree], opts: &GradOptions) -> Result<(Tree, Tree)> {
    let (value, grads, _) = grad_parts(f, args, opts)?;
    Ok((value, grads))
}

fn grad_parts(
    f: &TreeFn,
    args: &[Tree],
    opts: &GradOptions,
) -> Result<(Tree, Tree, Option<Tree>)> {
    let argnums: Vec<usize> = if opts.argnums.is_empty() {
        vec![0]
    } else {
        opts.argnums.clone()
    };
    if let Some(bad) = argnums.iter().find(|i| **i >= args.len()) {
        return Err(TraceError::PytreeStructureMismatch(format!(
            "argnum {bad} out of range for {} arguments",
            args.len()
        )));
    }

    let selected: Vec<Tree> = argnums.iter().map(|i| args[*i].clone()).collect();
    let g = |sel: &[Tree]| -> Result<Tree> {
        let mut merged = args.to_vec();
        for (slot, tree) in argnums.iter().zip(sel) {
            merged[*slot] = tree.clone();
        }
        f(&merged)
    };

    let (value, backward, aux) = vjp_impl(&g, &selected, opts.has_aux)?;

    // The differentiated output must be a float (or holomorphic) scalar.
    let (value_leaves, value_def) = flatten(&value)?;
    if value_def != TreeDef::Leaf || value_leaves[0].rank() != 0 {
        let shape = value_leaves
            .first()
            .map(|v| format!("{}", v.shaped_aval()))
            .unwrap_or_else(|| "an empty tree".into());
        return Err(TraceError::OutputNotScalar(shape));
    }
    let dtype = value_leaves[0].dtype();
    if dtype.is_complex() && !opts.holomorphic {
        return Err(TraceError::DTypeMismatch(
            "grad of a complex output requires holomorphic=true".into(),
        ));
    }
    if !dtype.is_inexact() {
        return Err(TraceError::DTypeMismatch(format!(
            "grad requires a float output, got {dtype}"
        )));
    }

    let ct = np::scalar(1.0, dtype);
    let grads = backward.call(&Tree::Leaf(ct))?;
    let grads = if argnums.len() == 1 {
        grads.into_iter().next().ok_or_else(|| {
            TraceError::PytreeStructureMismatch("missing gradient output".into())
        })?
    } else {
        Tree::List(grads)
    };
    Ok((value, grads, aux))
}

/// Dense Jacobian by forward-mode sweeps over the standard basis. The
/// result has shape `out_shape ++ in_shape`. Requires concrete arguments.
pub fn jacfwd(f: &TreeFn, args: &[Tree]) -> Result<Value> {
    let (x, out_aval) = jacobian_endpoints(f, args)?;
    let n = x.size();
    let out_size = out_aval.size();
    let mut data = vec![0.0f64; out_size * n];
    for j in 0..n {
        let tangent = basis(&x.aval(), j)?;
        let tangent_args = {
            let mut t = args.to_vec();
            t[0] = Tree::Leaf(tangent);
            for slot in t.iter_mut().skip(1) {
                *slot = zero_tree(slot)?;
            }
            t
        };
        let (_, touts) = jvp(f, args, &tangent_args)?;
        let col = concrete_leaf(&touts)?.to_f64_vec()?;
        for (o, v) in col.iter().enumerate() {
            data[o * n + j] = *v;
        }
    }
    assemble_jacobian(data, &out_aval, &x)
}

/// Dense Jacobian by reverse-mode sweeps over the standard basis of the
/// output. Same layout as [`jacfwd`].
pub fn jacrev(f: &TreeFn, args: &[Tree]) -> Result<Value> {
    let (x, out_aval) = jacobian_endpoints(f, args)?;
    let n = x.size();
    let out_size = out_aval.size();
    let (_, backward) = vjp(f, args)?;
    let mut data = vec![0.0f64; out_size * n];
    for o in 0..out_size {
        let ct = basis(&out_aval, o)?;
        let ct_ins = backward.call(&Tree::Leaf(ct))?;
        let row = concrete_leaf(
            ct_ins
                .first()
                .ok_or_else(|| TraceError::PytreeStructureMismatch("no inputs".into()))?,
        )?
        .to_f64_vec()?;
        for (j, v) in row.iter().enumerate() {
            data[o * n + j] = *v;
        }
    }
    assemble_jacobian(data, &out_aval, &x)
}

fn jacobian_endpoints(
    f: &TreeFn,
    args: &[Tree],
) -> Result<(crate::array::ArrayRef, ShapedArray)> {
    let x = args
        .first()
        .and_then(Tree::as_leaf)
        .and_then(Value::as_concrete)
        .cloned()
        .ok_or_else(|| {
            TraceError::LevelViolation(
                "jacobian assembly requires a concrete array argument".into(),
            )
        })?;
    let out = f(args)?;
    let out_leaf = concrete_leaf(&out)?;
    Ok((x.clone(), out_leaf.aval()))
}

fn concrete_leaf(tree: &Tree) -> Result<crate::array::ArrayRef> {
    tree.as_leaf()
        .and_then(Value::as_concrete)
        .cloned()
        .ok_or_else(|| {
            TraceError::LevelViolation(
                "jacobian assembly requires concrete array values".into(),
            )
        })
}

fn basis(aval: &ShapedArray, index: usize) -> Result<Value> {
    let mut data = vec![0.0f64; aval.size()];
    data[index] = 1.0;
    let arr = crate::array::ArrayValue::from_f64(&aval.shape, data)?.astype(aval.dtype)?;
    Ok(Value::concrete(arr))
}

fn zero_tree(tree: &Tree) -> Result<Tree> {
    crate::pytree::tree_map(&mut |v: &Value| Ok(crate::trace::zeros_like(v)), tree)
}

fn assemble_jacobian(
    data: Vec<f64>,
    out_aval: &ShapedArray,
    x: &crate::array::ArrayValue,
) -> Result<Value> {
    let mut shape = out_aval.shape.clone();
    shape.extend_from_slice(x.shape());
    let dtype = DType::promote(out_aval.dtype, x.dtype());
    let arr = crate::array::ArrayValue::from_f64(&shape, data)?.astype(dtype)?;
    Ok(Value::concrete(arr))
}

/// Automatic batching: map `f` over the axis `in_axes[i]` of each argument
/// and place the batch axis of the result at `out_axes`.
pub fn vmap(
    f: &TreeFn,
    in_axes: &[Option<usize>],
    out_axes: usize,
    args: &[Tree],
) -> Result<Tree> {
    if in_axes.len() != args.len() {
        return Err(TraceError::PytreeStructureMismatch(format!(
            "vmap got {} axes for {} arguments",
            in_axes.len(),
            args.len()
        )));
    }

    let mut leaves: Vec<Value> = Vec::new();
    let mut dims: Vec<Option<usize>> = Vec::new();
    let mut defs: Vec<TreeDef> = Vec::new();
    let mut axis_size: Option<usize> = None;
    for (tree, ax) in args.iter().zip(in_axes) {
        let (ls, def) = flatten(tree)?;
        for leaf in &ls {
            if let Some(a) = ax {
                let shape = leaf.shape();
                if *a >= shape.len() {
                    return Err(TraceError::ShapeMismatch(format!(
                        "vmap axis {a} out of range for {}",
                        leaf.shaped_aval()
                    )));
                }
                match axis_size {
                    None => axis_size = Some(shape[*a]),
                    Some(n) if n == shape[*a] => {}
                    Some(n) => {
                        return Err(TraceError::ShapeMismatch(format!(
                            "vmap axis sizes disagree: {n} vs {}",
                            shape[*a]
                        )))
                    }
                }
            }
            dims.push(*ax);
        }
        leaves.extend(ls);
        defs.push(def);
    }
    let axis_size = axis_size.ok_or_else(|| {
        TraceError::ShapeMismatch("vmap requires at least one mapped argument".into())
    })?;

    let in_def = TreeDef::List(defs);
    let flat = FlatFun::new(f, in_def);
    let (out_vals, out_dims) = batch::batch_raw(
        &|vals: &[Value]| flat.call(vals),
        &leaves,
        &dims,
        axis_size,
    )?;
    let moved = out_vals
        .iter()
        .zip(&out_dims)
        .map(|(v, d)| batch::move_batch_axis(axis_size, *d, out_axes, v))
        .collect::<Result<Vec<_>>>()?;
    unflatten(&flat.out_def()?, &moved)
}
