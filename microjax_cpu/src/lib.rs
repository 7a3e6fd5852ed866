//! Dense CPU kernels for the microjax core.
//!
//! One kernel per primitive name, registered into the core's backend
//! `impl` table by [`install`]. Kernels work on row-major
//! [`microjax::ArrayValue`] buffers, coerce mixed input dtypes to the
//! promoted dtype, and report failures as backend errors.

mod elementwise;
mod matmul;
mod reduce;
mod shape;
pub(crate) mod util;

use microjax::backend::register_impl;
use std::cell::Cell;

thread_local! {
    static INSTALLED: Cell<bool> = const { Cell::new(false) };
}

/// Register every CPU kernel (idempotent, per thread). Call once before
/// eager execution or jit dispatch.
pub fn install() {
    if INSTALLED.with(Cell::get) {
        return;
    }
    INSTALLED.with(|i| i.set(true));

    register_impl("add", elementwise::add);
    register_impl("sub", elementwise::sub);
    register_impl("mul", elementwise::mul);
    register_impl("div", elementwise::div);
    register_impl("neg", elementwise::neg);
    register_impl("sin", elementwise::sin);
    register_impl("cos", elementwise::cos);
    register_impl("exp", elementwise::exp);
    register_impl("log", elementwise::log);
    register_impl("sqrt", elementwise::sqrt);
    register_impl("greater", elementwise::greater);
    register_impl("less", elementwise::less);
    register_impl("equal", elementwise::equal);
    register_impl("convert", elementwise::convert);
    register_impl("reduce_sum", reduce::reduce_sum);
    register_impl("broadcast", shape::broadcast);
    register_impl("transpose", shape::transpose);
    register_impl("reshape", shape::reshape);
    register_impl("matmul", matmul::matmul);
}
