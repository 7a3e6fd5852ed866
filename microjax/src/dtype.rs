//! Element dtypes and the fixed promotion lattice.
//!
//! Promotion is a total order, so the joined dtype of a binary operation is
//! simply the maximum of its operand dtypes:
//!
//! ```text
//! bool < i32 < i64 < f16 < f32 < f64 < c64
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of an array. Declaration order is promotion order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DType {
    Bool,
    I32,
    I64,
    F16,
    F32,
    F64,
    C64,
}

impl DType {
    /// Short name used by the jaxpr text form (`f32`, `i64`, ...).
    pub fn short_name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::C64 => "c64",
        }
    }

    /// Inverse of [`DType::short_name`].
    pub fn from_short_name(name: &str) -> Option<DType> {
        Some(match name {
            "bool" => DType::Bool,
            "i32" => DType::I32,
            "i64" => DType::I64,
            "f16" => DType::F16,
            "f32" => DType::F32,
            "f64" => DType::F64,
            "c64" => DType::C64,
            _ => return None,
        })
    }

    /// Join of two dtypes on the promotion lattice.
    pub fn promote(a: DType, b: DType) -> DType {
        a.max(b)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DType::C64)
    }

    /// Float or complex: the dtypes that carry nontrivial tangents.
    pub fn is_inexact(self) -> bool {
        self.is_float() || self.is_complex()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}
