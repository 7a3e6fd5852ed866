//! The interpreter stack: traces, tracers, and `bind`.
//!
//! A process-wide (thread-local) stack of [`MainTrace`] records decides how
//! each primitive application is handled. The bottom of the stack is always
//! the eager interpreter; transformations push a trace for their dynamic
//! extent and wrap values in tracers owned by that trace. `bind` lifts all
//! arguments to the topmost relevant trace, hands them to that trace's
//! interpreter, and unboxes outputs that no longer need the top trace.
//!
//! Pushes are scoped acquisitions: the guard returned by [`push_trace`]
//! restores the stack on every exit path. A guard dropped out of LIFO order
//! poisons the stack, and further use is refused.

pub(crate) mod batch;
pub(crate) mod eager;
pub(crate) mod jvp;
pub(crate) mod partial;

use crate::array::{ArrayRef, ArrayValue};
use crate::aval::{Aval, ShapedArray};
use crate::dtype::DType;
use crate::error::{Result, TraceError};
use crate::ir::VarId;
use crate::primitive::{self, Params};
use partial::JaxprBuilder;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Which interpreter a trace runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Eval,
    Jvp,
    Jaxpr,
    Batch,
}

/// Per-trace interpreter state.
#[derive(Debug)]
pub enum TracePayload {
    Eval,
    Jvp,
    Jaxpr(Rc<RefCell<JaxprBuilder>>),
    Batch { axis_size: usize },
}

/// One level of the interpreter stack.
#[derive(Debug)]
pub struct MainTrace {
    pub level: usize,
    pub kind: TraceKind,
    pub payload: TracePayload,
    alive: Cell<bool>,
}

impl MainTrace {
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub(crate) fn builder(&self) -> Option<Rc<RefCell<JaxprBuilder>>> {
        match &self.payload {
            TracePayload::Jaxpr(b) => Some(b.clone()),
            _ => None,
        }
    }
}

thread_local! {
    static STACK: RefCell<Vec<Rc<MainTrace>>> = RefCell::new(vec![Rc::new(MainTrace {
        level: 0,
        kind: TraceKind::Eval,
        payload: TracePayload::Eval,
        alive: Cell::new(true),
    })]);
    static DYNAMIC: RefCell<Option<Rc<MainTrace>>> = const { RefCell::new(None) };
    static POISONED: Cell<bool> = const { Cell::new(false) };
}

fn check_usable() -> Result<()> {
    if POISONED.with(Cell::get) {
        return Err(TraceError::LevelViolation(
            "interpreter stack was poisoned by an out-of-order pop".into(),
        ));
    }
    Ok(())
}

/// Push a trace for the dynamic extent of the returned guard.
pub fn push_trace(kind: TraceKind, payload: TracePayload) -> TraceGuard {
    let trace = STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let trace = Rc::new(MainTrace {
            level: stack.len(),
            kind,
            payload,
            alive: Cell::new(true),
        });
        stack.push(trace.clone());
        trace
    });
    tracing::debug!(level = trace.level, kind = ?trace.kind, "push trace");
    TraceGuard { trace }
}

/// Scoped handle to a pushed trace; dropping it pops the trace.
#[derive(Debug)]
pub struct TraceGuard {
    trace: Rc<MainTrace>,
}

impl TraceGuard {
    pub fn trace(&self) -> Rc<MainTrace> {
        self.trace.clone()
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        self.trace.alive.set(false);
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if Rc::ptr_eq(top, &self.trace) => {
                    stack.pop();
                }
                _ => POISONED.with(|p| p.set(true)),
            }
        });
        tracing::debug!(level = self.trace.level, "pop trace");
    }
}

/// Install a trace as the dynamic trace (staging override) for the extent
/// of the returned guard.
pub fn set_dynamic(trace: Rc<MainTrace>) -> DynamicGuard {
    let previous = DYNAMIC.with(|d| d.borrow_mut().replace(trace));
    DynamicGuard { previous }
}

/// Whether a dynamic (staging) trace is currently installed.
pub(crate) fn has_dynamic_trace() -> bool {
    DYNAMIC.with(|d| d.borrow().is_some())
}

/// Restores the previous dynamic trace on drop.
#[derive(Debug)]
pub struct DynamicGuard {
    previous: Option<Rc<MainTrace>>,
}

impl Drop for DynamicGuard {
    fn drop(&mut self) {
        DYNAMIC.with(|d| *d.borrow_mut() = self.previous.take());
    }
}

/// Trace-specific payload of a tracer.
#[derive(Debug, Clone)]
pub enum TracerPayload {
    /// Forward-mode pair; the tangent has the primal's abstract value.
    Jvp { primal: Value, tangent: Value },
    /// A binder of the jaxpr under construction.
    JaxprVar { id: VarId },
    /// A value captured from below the jaxpr trace; concrete captures fold,
    /// others become constants of the finished jaxpr.
    JaxprConst { val: Value },
    /// A value with an optional implicit leading batch axis.
    Batch { val: Value, bdim: Option<usize> },
}

/// An IR-side stand-in for a value, owned by a trace.
#[derive(Debug)]
pub struct TracerInner {
    pub trace: Rc<MainTrace>,
    pub aval: Aval,
    pub payload: TracerPayload,
}

/// What user code manipulates: a concrete buffer handle or a tracer.
#[derive(Debug, Clone)]
pub enum Value {
    Concrete(ArrayRef),
    Tracer(Rc<TracerInner>),
}

impl Value {
    pub fn concrete(a: ArrayValue) -> Value {
        Value::Concrete(Rc::new(a))
    }

    pub(crate) fn tracer(trace: Rc<MainTrace>, aval: Aval, payload: TracerPayload) -> Value {
        Value::Tracer(Rc::new(TracerInner {
            trace,
            aval,
            payload,
        }))
    }

    pub fn aval(&self) -> Aval {
        match self {
            Value::Concrete(a) => Aval::Concrete {
                aval: a.aval(),
                value: a.clone(),
            },
            Value::Tracer(t) => t.aval.clone(),
        }
    }

    pub fn shaped_aval(&self) -> ShapedArray {
        match self {
            Value::Concrete(a) => a.aval(),
            Value::Tracer(t) => t.aval.to_shaped(),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.shaped_aval().shape
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn dtype(&self) -> DType {
        self.shaped_aval().dtype
    }

    /// The trace level owning this value; concrete values live at level 0.
    pub fn level(&self) -> usize {
        match self {
            Value::Concrete(_) => 0,
            Value::Tracer(t) => t.trace.level,
        }
    }

    /// The underlying buffer, when this value is concrete.
    pub fn as_concrete(&self) -> Option<&ArrayRef> {
        match self {
            Value::Concrete(a) => Some(a),
            Value::Tracer(_) => None,
        }
    }

    /// Identity comparison: same buffer handle or same tracer.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Concrete(a), Value::Concrete(b)) => Rc::ptr_eq(a, b),
            (Value::Tracer(a), Value::Tracer(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Concrete zeros with the shape and dtype of `v`.
pub fn zeros_like(v: &Value) -> Value {
    Value::concrete(ArrayValue::zeros(&v.shaped_aval()))
}

/// Apply a primitive: route through the topmost relevant trace.
pub fn bind(prim_name: &str, args: Vec<Value>, params: Params) -> Result<Vec<Value>> {
    check_usable()?;
    let prim = primitive::lookup(prim_name)?;
    let top = top_trace_for(&args)?;
    let args = args
        .into_iter()
        .map(|a| full_raise(&top, a))
        .collect::<Result<Vec<_>>>()?;
    let outs = match top.kind {
        TraceKind::Eval => eager::process(&prim, &args, &params),
        TraceKind::Jvp => jvp::process(&top, &prim, &args, &params),
        TraceKind::Jaxpr => partial::process(&top, &prim, &args, &params),
        TraceKind::Batch => batch::process(&top, &prim, &args, &params),
    }?;
    Ok(outs.into_iter().map(full_lower).collect())
}

/// Apply a single-output primitive.
pub fn bind1(prim_name: &str, args: Vec<Value>, params: Params) -> Result<Value> {
    let mut outs = bind(prim_name, args, params)?;
    match (outs.len(), outs.pop()) {
        (1, Some(v)) => Ok(v),
        (n, _) => Err(TraceError::Backend(format!(
            "'{prim_name}' returned {n} outputs, expected 1"
        ))),
    }
}

/// The topmost relevant trace: the highest level among argument tracers,
/// overridden by the dynamic trace when that sits higher.
fn top_trace_for(args: &[Value]) -> Result<Rc<MainTrace>> {
    let mut top: Option<Rc<MainTrace>> = None;
    for arg in args {
        if let Value::Tracer(t) = arg {
            if !t.trace.is_alive() {
                return Err(TraceError::LevelViolation(format!(
                    "tracer (level {}) outlived its trace",
                    t.trace.level
                )));
            }
            if top.as_ref().map_or(true, |b| t.trace.level > b.level) {
                top = Some(t.trace.clone());
            }
        }
    }
    let dynamic = DYNAMIC.with(|d| d.borrow().clone());
    if let Some(d) = dynamic {
        if top.as_ref().map_or(true, |b| d.level > b.level) {
            top = Some(d);
        }
    }
    match top {
        Some(t) => Ok(t),
        None => STACK.with(|s| {
            s.borrow().first().cloned().ok_or_else(|| {
                TraceError::LevelViolation("empty interpreter stack".into())
            })
        }),
    }
}

/// Embed a value into `top`'s trace: tracers of `top` pass through, values
/// from lower levels are lifted by the trace's `pure` rule, and anything
/// from a higher level is a level violation.
fn full_raise(top: &Rc<MainTrace>, v: Value) -> Result<Value> {
    let level = v.level();
    if let Value::Tracer(t) = &v {
        if !t.trace.is_alive() {
            return Err(TraceError::LevelViolation(format!(
                "tracer (level {}) outlived its trace",
                t.trace.level
            )));
        }
        if level == top.level {
            return if Rc::ptr_eq(&t.trace, top) {
                Ok(v)
            } else {
                Err(TraceError::LevelViolation(format!(
                    "tracer belongs to a different trace at level {level}"
                )))
            };
        }
        if level > top.level {
            return Err(TraceError::LevelViolation(format!(
                "tracer of level {level} appeared under a trace of level {}",
                top.level
            )));
        }
    } else if top.level == 0 {
        return Ok(v);
    }
    // Lift a lower-level value into `top`.
    match top.kind {
        TraceKind::Eval => Ok(v),
        TraceKind::Jvp => {
            let tangent = zeros_like(&v);
            let aval = Aval::Shaped(v.shaped_aval());
            Ok(Value::tracer(
                top.clone(),
                aval,
                TracerPayload::Jvp { primal: v, tangent },
            ))
        }
        TraceKind::Jaxpr => {
            let aval = v.aval();
            Ok(Value::tracer(
                top.clone(),
                aval,
                TracerPayload::JaxprConst { val: v },
            ))
        }
        TraceKind::Batch => {
            let aval = v.aval();
            Ok(Value::tracer(
                top.clone(),
                aval,
                TracerPayload::Batch { val: v, bdim: None },
            ))
        }
    }
}

/// Unbox an output that no longer needs its top trace.
pub(crate) fn full_lower(v: Value) -> Value {
    if let Value::Tracer(t) = &v {
        match &t.payload {
            TracerPayload::Batch { val, bdim: None } => return full_lower(val.clone()),
            TracerPayload::JaxprConst { val } => return val.clone(),
            _ => {}
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_starts_with_the_eager_trace() {
        let top = top_trace_for(&[]).unwrap();
        assert_eq!(top.level, 0);
        assert_eq!(top.kind, TraceKind::Eval);
    }

    #[test]
    fn guards_pop_in_lifo_order() {
        let g1 = push_trace(TraceKind::Jvp, TracePayload::Jvp);
        assert_eq!(g1.trace().level, 1);
        {
            let g2 = push_trace(TraceKind::Jvp, TracePayload::Jvp);
            assert_eq!(g2.trace().level, 2);
        }
        assert!(g1.trace().is_alive());
        drop(g1);
        assert_eq!(top_trace_for(&[]).unwrap().level, 0);
    }

    #[test]
    fn escaped_tracers_are_rejected() {
        let leaked = {
            let guard = push_trace(TraceKind::Jvp, TracePayload::Jvp);
            let x = Value::concrete(ArrayValue::from_scalar(1.0, DType::F64));
            Value::tracer(
                guard.trace(),
                Aval::Shaped(x.shaped_aval()),
                TracerPayload::Jvp {
                    primal: x.clone(),
                    tangent: zeros_like(&x),
                },
            )
        };
        let err = top_trace_for(&[leaked]).unwrap_err();
        assert!(matches!(err, TraceError::LevelViolation(_)));
    }

    #[test]
    fn dynamic_trace_overrides_the_top() {
        let guard = push_trace(
            TraceKind::Jaxpr,
            TracePayload::Jaxpr(Rc::new(RefCell::new(JaxprBuilder::default()))),
        );
        let _dynamic = set_dynamic(guard.trace());
        let top = top_trace_for(&[]).unwrap();
        assert_eq!(top.level, 1);
        assert_eq!(top.kind, TraceKind::Jaxpr);
    }
}
