//! The backend `impl` table.
//!
//! For each registered primitive name the backend provides a kernel
//! executing on concrete buffers. Kernels are registered at initialisation
//! (append-only) by a backend crate; the core never implements a
//! mathematical primitive itself. A missing kernel surfaces as
//! `MissingRule(primitive, "impl")`.

use crate::array::ArrayRef;
use crate::error::{Result, TraceError};
use crate::primitive::Params;
use std::cell::RefCell;
use std::collections::HashMap;

/// A per-primitive kernel: concrete inputs and parameters to concrete
/// outputs. Kernels coerce mixed input dtypes themselves.
pub type ImplFn = fn(&[ArrayRef], &Params) -> Result<Vec<ArrayRef>>;

thread_local! {
    static IMPLS: RefCell<HashMap<String, ImplFn>> = RefCell::new(HashMap::new());
}

/// Register a kernel for a primitive name. Re-registration keeps the first
/// kernel.
pub fn register_impl(name: &str, f: ImplFn) {
    IMPLS.with(|impls| {
        impls.borrow_mut().entry(name.to_string()).or_insert(f);
    });
}

/// Whether a kernel is available for the primitive.
pub fn has_impl(name: &str) -> bool {
    IMPLS.with(|impls| impls.borrow().contains_key(name))
}

/// Look up a kernel by primitive name.
pub fn lookup_impl(name: &str) -> Result<ImplFn> {
    IMPLS.with(|impls| {
        impls.borrow().get(name).copied().ok_or_else(|| {
            TraceError::MissingRule {
                primitive: name.to_string(),
                transform: "impl",
            }
        })
    })
}
