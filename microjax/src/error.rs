//! Error kinds surfaced by the tracing core.
//!
//! Errors are a single tagged enum rather than a hierarchy: callers match on
//! the kind, messages carry the detail. Tracing-time errors abort the
//! in-progress transformation; no partial jaxpr is ever returned.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TraceError>;

/// The error kinds of the tracing core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraceError {
    /// Incompatible broadcast or rank mismatch during abstract evaluation.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Promotion refused, or an operation applied to an unsupported dtype.
    #[error("dtype mismatch: {0}")]
    DTypeMismatch(String),

    /// A primitive is missing a rule required by the active transformation
    /// (including a missing backend `impl`).
    #[error("primitive '{primitive}' has no {transform} rule")]
    MissingRule {
        primitive: String,
        transform: &'static str,
    },

    /// A tracer escaped its trace, or a lower-level trace received a
    /// higher-level tracer.
    #[error("level violation: {0}")]
    LevelViolation(String),

    /// A jit static argument could not participate in the cache key.
    #[error("static argument: {0}")]
    StaticArgChange(String),

    /// Mismatched container structure between calls of the same transformed
    /// function, or `map` over differently shaped trees.
    #[error("pytree structure mismatch: {0}")]
    PytreeStructureMismatch(String),

    /// An error reported by the array backend, wrapped verbatim.
    #[error("backend: {0}")]
    Backend(String),

    /// `grad` applied to a function whose output is not a scalar.
    #[error("grad requires a scalar output, got {0}")]
    OutputNotScalar(String),
}
