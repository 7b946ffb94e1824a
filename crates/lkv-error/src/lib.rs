#![forbid(unsafe_code)]
//! Error types for latchkv.
//!
//! Defines `LkvError` and a `Result<T>` alias used throughout the
//! workspace. Precondition failures (version mismatch, value already
//! exists, value absent) are deliberately **not** errors: operations
//! report them through their return value so callers branch on data, not
//! on an error path.

use thiserror::Error;

/// Unified error type for all latchkv storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LkvError {
    /// The storage has been closed. Terminal: every subsequent operation
    /// on the instance fails with this, including `close` itself.
    #[error("storage closed")]
    Closed,

    /// A blocking wait reached its deadline before the watched value
    /// changed. Only the deadline/timeout wait forms return this.
    #[error("wait deadline elapsed")]
    WaitTimeout,
}

/// Result alias using `LkvError`.
pub type Result<T> = std::result::Result<T, LkvError>;
