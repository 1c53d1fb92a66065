//! Value-level errors: the subset of spec.md §7's error categories that can
//! arise purely from operator/coercion logic, before a VM or call frame is
//! involved. `pvm-runtime` widens this into `RuntimeError`.
//!
//! Follows the teacher crate's convention (see `seqc::codegen::CodeGenError`)
//! of a hand-rolled enum with `Display`/`Error` impls rather than pulling in
//! `thiserror`.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ValueError {
    /// An operator or builtin received a `Value` of unsupported kind.
    TypeMismatch(String),
    /// `Byte`/`Word` overflow, array index out of bounds, `Succ`/`Pred`
    /// overflow, or an invalid enum ordinal.
    RangeCheck(String),
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            ValueError::RangeCheck(msg) => write!(f, "range check error: {msg}"),
        }
    }
}

impl std::error::Error for ValueError {}
