//! Jit: trace once, cache, re-dispatch.
//!
//! The cache key is the dynamic-argument structure, the abstract value of
//! every dynamic leaf, and a byte fingerprint of the static arguments. A
//! hit returns the identical cached program. When a jitted function is
//! called inside another tracing context it stages a `jit` equation
//! carrying the closed sub-jaxpr instead of dispatching, which is what
//! lets `jit` nest inside `grad`, `vmap`, and other `jit`s.
//!
//! The cache is a bounded thread-local-per-instance store with
//! oldest-first eviction; it is never persisted.

use crate::aval::ShapedArray;
use crate::error::{Result, TraceError};
use crate::ir::{eval_closed_jaxpr, ClosedJaxpr};
use crate::primitive::{ParamValue, Params};
use crate::pytree::{flatten, unflatten, Tree, TreeDef};
use crate::trace::{bind, has_dynamic_trace, partial, Value};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

const CACHE_CAP: usize = 128;
/// Misses on one dynamic signature before we warn that the static
/// arguments are churning the cache.
const STATIC_CHURN_THRESHOLD: u32 = 8;

/// Options for [`jit`].
#[derive(Debug, Clone, Default)]
pub struct JitOptions {
    /// Argument positions compared by structural equality instead of being
    /// traced; they fold as constants into the compiled program.
    pub static_argnums: Vec<usize>,
    /// Name used for staged call equations.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JitKey {
    in_def: TreeDef,
    avals: Vec<ShapedArray>,
    statics: Vec<(TreeDef, Vec<Vec<u8>>)>,
}

#[derive(Debug, Default)]
struct JitCache {
    entries: HashMap<JitKey, (ClosedJaxpr, TreeDef)>,
    order: VecDeque<JitKey>,
    misses_by_signature: HashMap<(TreeDef, Vec<ShapedArray>), u32>,
}

/// A jit-wrapped function.
pub struct Jitted {
    f: Rc<dyn Fn(&[Tree]) -> Result<Tree>>,
    opts: JitOptions,
    cache: RefCell<JitCache>,
}

impl std::fmt::Debug for Jitted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jitted")
            .field("name", &self.opts.name)
            .field("cached", &self.cache.borrow().entries.len())
            .finish()
    }
}

/// Wrap `f` for traced compilation with caching.
pub fn jit<F>(f: F, opts: JitOptions) -> Jitted
where
    F: Fn(&[Tree]) -> Result<Tree> + 'static,
{
    Jitted {
        f: Rc::new(f),
        opts,
        cache: RefCell::new(JitCache::default()),
    }
}

impl Jitted {
    /// Number of compiled programs currently cached.
    pub fn cache_size(&self) -> usize {
        self.cache.borrow().entries.len()
    }

    pub fn call(&self, args: &[Tree]) -> Result<Tree> {
        let (static_args, dynamic_args) = self.split_args(args)?;
        let (leaves, in_def) = flatten(&Tree::List(dynamic_args))?;
        let avals: Vec<ShapedArray> = leaves.iter().map(Value::shaped_aval).collect();

        let staging = has_dynamic_trace()
            || leaves.iter().any(|v| matches!(v, Value::Tracer(_)));
        if staging {
            return self.stage(&static_args, &in_def, &avals, leaves);
        }

        let key = JitKey {
            in_def: in_def.clone(),
            avals: avals.clone(),
            statics: static_args
                .iter()
                .map(|t| fingerprint_static(t))
                .collect::<Result<_>>()?,
        };
        let cached = self.cache.borrow().entries.get(&key).cloned();
        if let Some((closed, out_def)) = cached {
            tracing::debug!(name = %self.opts.name, "jit cache hit");
            let outs = eval_closed_jaxpr(&closed, &leaves)?;
            return unflatten(&out_def, &outs);
        }

        tracing::debug!(name = %self.opts.name, "jit cache miss");
        let (jaxpr, const_vals, out_def) = self.trace(&static_args, &in_def, &avals)?;
        let consts = const_vals
            .iter()
            .map(|v| {
                v.as_concrete().cloned().ok_or_else(|| {
                    TraceError::LevelViolation(
                        "jitted function closed over a live tracer".into(),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let closed = ClosedJaxpr::new(jaxpr, consts);
        self.insert(key, closed.clone(), out_def.clone());

        let outs = eval_closed_jaxpr(&closed, &leaves)?;
        unflatten(&out_def, &outs)
    }

    /// Trace the wrapped function abstractly on the dynamic signature.
    fn trace(
        &self,
        static_args: &[(usize, Tree)],
        in_def: &TreeDef,
        avals: &[ShapedArray],
    ) -> Result<(crate::ir::Jaxpr, Vec<Value>, TreeDef)> {
        let out_def: RefCell<Option<TreeDef>> = RefCell::new(None);
        let f = &self.f;
        let flat = |vals: &[Value]| -> Result<Vec<Value>> {
            let dynamic = match unflatten(in_def, vals)? {
                Tree::List(trees) => trees,
                _ => unreachable!("argument treedef is a list"),
            };
            let merged = merge_args(static_args, dynamic);
            let out = f(&merged)?;
            let (out_leaves, def) = flatten(&out)?;
            let mut slot = out_def.borrow_mut();
            match &*slot {
                None => *slot = Some(def),
                Some(prev) if *prev == def => {}
                Some(_) => {
                    return Err(TraceError::PytreeStructureMismatch(
                        "jitted function returned a different structure than before"
                            .into(),
                    ))
                }
            }
            Ok(out_leaves)
        };
        let (jaxpr, const_vals) = partial::trace_to_jaxpr(&flat, avals)?;
        let out_def = out_def.into_inner().ok_or_else(|| {
            TraceError::PytreeStructureMismatch(
                "jitted function was never called during tracing".into(),
            )
        })?;
        Ok((jaxpr, const_vals, out_def))
    }

    /// Inside another tracing context: emit a `jit` equation instead of
    /// dispatching. Captured constants (possibly tracers of outer traces)
    /// become leading call inputs.
    fn stage(
        &self,
        static_args: &[(usize, Tree)],
        in_def: &TreeDef,
        avals: &[ShapedArray],
        leaves: Vec<Value>,
    ) -> Result<Tree> {
        let (jaxpr, const_vals, out_def) = self.trace(static_args, in_def, avals)?;
        let (stripped, num_consts) = jaxpr.consts_to_invars();
        let mut call_args = const_vals;
        call_args.extend(leaves);
        let outs = bind(
            "jit",
            call_args,
            Params::new()
                .with("jaxpr", ParamValue::Jaxpr(Rc::new(stripped)))
                .with("name", ParamValue::Str(self.opts.name.clone()))
                .with("num_consts", ParamValue::Int(num_consts as i64)),
        )?;
        unflatten(&out_def, &outs)
    }

    fn split_args(&self, args: &[Tree]) -> Result<(Vec<(usize, Tree)>, Vec<Tree>)> {
        if let Some(bad) = self
            .opts
            .static_argnums
            .iter()
            .find(|i| **i >= args.len())
        {
            return Err(TraceError::StaticArgChange(format!(
                "static argnum {bad} out of range for {} arguments",
                args.len()
            )));
        }
        let mut statics = Vec::new();
        let mut dynamics = Vec::new();
        for (i, tree) in args.iter().enumerate() {
            if self.opts.static_argnums.contains(&i) {
                statics.push((i, tree.clone()));
            } else {
                dynamics.push(tree.clone());
            }
        }
        Ok((statics, dynamics))
    }

    fn insert(&self, key: JitKey, closed: ClosedJaxpr, out_def: TreeDef) {
        let mut cache = self.cache.borrow_mut();
        let signature = (key.in_def.clone(), key.avals.clone());
        let misses = cache.misses_by_signature.entry(signature).or_insert(0);
        *misses += 1;
        if *misses == STATIC_CHURN_THRESHOLD {
            tracing::warn!(
                name = %self.opts.name,
                "static arguments change on every call; the jit cache keeps recompiling"
            );
        }
        if cache.entries.len() >= CACHE_CAP {
            if let Some(evicted) = cache.order.pop_front() {
                cache.entries.remove(&evicted);
            }
        }
        cache.order.push_back(key.clone());
        cache.entries.insert(key, (closed, out_def));
    }
}

fn merge_args(static_args: &[(usize, Tree)], dynamic: Vec<Tree>) -> Vec<Tree> {
    let total = static_args.len() + dynamic.len();
    let mut dynamic = dynamic.into_iter();
    let mut merged = Vec::with_capacity(total);
    for i in 0..total {
        match static_args.iter().find(|(slot, _)| *slot == i) {
            Some((_, tree)) => merged.push(tree.clone()),
            None => match dynamic.next() {
                Some(tree) => merged.push(tree),
                None => break,
            },
        }
    }
    merged
}

/// Structural-equality fingerprint of a static argument. Static arguments
/// must be concrete: a tracer cannot participate in a cache key.
fn fingerprint_static(entry: &(usize, Tree)) -> Result<(TreeDef, Vec<Vec<u8>>)> {
    let (leaves, def) = flatten(&entry.1)?;
    let prints = leaves
        .iter()
        .map(|v| {
            v.as_concrete().map(|a| a.fingerprint()).ok_or_else(|| {
                TraceError::StaticArgChange(
                    "static argument is a tracer and cannot be hashed".into(),
                )
            })
        })
        .collect::<Result<_>>()?;
    Ok((def, prints))
}
