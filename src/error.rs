//! Error kinds for the public map and transaction APIs.
//!
//! A small, closed set of error kinds as a proper enum rather than
//! stringly-typed panics or sentinel return codes.

use std::fmt;

/// An error returned by a map or transaction operation.
///
/// `ABSENT` (no mapping) and "CAS expectation not met" are
/// deliberately *not* represented here -- they are folded into the
/// ordinary `Option`/observed-value return paths, not treated as error
/// conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A configuration option was not a valid choice (e.g. an
    /// unrecognized backend in a builder).
    InvalidOption,
    /// An argument was structurally invalid (e.g. storing the
    /// reserved `ABSENT` sentinel in a context that forbids it).
    InvalidArgument,
    /// The requested operation is not supported by this backend (e.g.
    /// `count()` on a structure that does not track it cheaply).
    Unsupported,
    /// A transaction operation was attempted after `commit`/`abort`
    /// already ran.
    TxnNotRunning,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MapError::InvalidOption => "invalid option",
            MapError::InvalidArgument => "invalid argument",
            MapError::Unsupported => "unsupported operation",
            MapError::TxnNotRunning => "transaction is not running",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for MapError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(MapError::TxnNotRunning.to_string(), "transaction is not running");
    }
}
