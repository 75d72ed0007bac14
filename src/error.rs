//! Errors that reach callers of the public API.
//!
//! Internal failures (provider outages, persistence I/O) are logged and
//! absorbed. Only caller-side contract violations surface here.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("search limit must be >= 1")]
    InvalidLimit,
}
