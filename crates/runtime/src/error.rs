//! Runtime error categories (spec §7) and the `interpret` outcome type
//! (spec §6.1).
//!
//! Per the redesign called for in spec.md §9 ("replace exit-flag sentinels
//! and `EXIT_FAILURE_HANDLER()` with a single error-propagation type"),
//! every VM primitive in this crate returns `Result<_, RuntimeError>`
//! instead of setting a global `abort_requested` flag; only [`vm::interpret`]
//! converts the terminal `Err` into an `InterpretResult`.

use pvm_core::ValueError;
use std::fmt;

/// One per error category in spec.md §7.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    ArityMismatch { expected: usize, got: usize, callee: String },
    TypeMismatch(String),
    RangeCheck(String),
    NilDereference(String),
    Io(String),
    Concurrency(String),
    Resource(String),
    HostMissing(String),
}

impl From<ValueError> for RuntimeError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::TypeMismatch(msg) => RuntimeError::TypeMismatch(msg),
            ValueError::RangeCheck(msg) => RuntimeError::RangeCheck(msg),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::ArityMismatch { expected, got, callee } => {
                write!(f, "'{callee}' expects {expected} argument(s), got {got}")
            }
            RuntimeError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            RuntimeError::RangeCheck(msg) => write!(f, "range check error: {msg}"),
            RuntimeError::NilDereference(msg) => write!(f, "nil dereference: {msg}"),
            RuntimeError::Io(msg) => write!(f, "I/O error: {msg}"),
            RuntimeError::Concurrency(msg) => write!(f, "concurrency error: {msg}"),
            RuntimeError::Resource(msg) => write!(f, "resource error: {msg}"),
            RuntimeError::HostMissing(msg) => write!(f, "host function missing: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Format and log a fatal runtime error (spec §7/§4.8: `runtime_error`).
/// The caller still propagates the returned error with `?`; this only
/// handles the side-channel reporting (line number, optional stack dump).
pub fn runtime_error(line: i32, err: RuntimeError) -> RuntimeError {
    tracing::error!(line, %err, "runtime error");
    err
}

/// Non-fatal variant (spec §4.8: `runtime_warning`). Does not abort.
pub fn runtime_warning(line: i32, message: &str) {
    tracing::warn!(line, message, "runtime warning");
}

/// Outcome of [`crate::vm::interpret`] (spec §6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}
