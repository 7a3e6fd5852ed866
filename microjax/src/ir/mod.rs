//! The typed IR ("jaxpr"): binders, equations, programs, and the
//! operations on them (pretty-printing, inlining, evaluation).

mod core;
mod display;
mod eval;
mod flatten;

pub use core::{Atom, ClosedJaxpr, Jaxpr, JaxprEqn, Var, VarId};
pub use display::pretty_jaxpr;
pub use eval::{eval_closed_jaxpr, eval_jaxpr};
pub use flatten::flatten_jaxpr;
