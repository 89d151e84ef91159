//! Errors reported by block devices.

use std::io;

use thiserror::Error;

/// Failure of a block-level operation.
///
/// The type is cheap to clone so the same failure can be recorded as a job's
/// final status while also being handed to the error policy.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BlockError {
    /// Generic I/O failure.
    #[error("I/O error: {message}")]
    Io {
        /// Classification of the underlying failure.
        kind: io::ErrorKind,
        /// Human readable description.
        message: String,
    },

    /// The device ran out of space.
    ///
    /// Kept separate from [`BlockError::Io`] because the `enospc` error policy
    /// pauses on this error and reports every other one.
    #[error("no space left on device")]
    NoSpace,

    /// The device does not implement the requested operation.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The request reaches past the end of the device.
    #[error("request at {offset} of {len} bytes exceeds device length {length}")]
    OutOfRange {
        /// Start of the request.
        offset: u64,
        /// Length of the request.
        len: u64,
        /// Current device length.
        length: u64,
    },

    /// A management operation is blocked on the node.
    #[error("node '{node}' is busy: {reason}")]
    Busy {
        /// Name of the blocked node.
        node: String,
        /// Reason recorded by the blocker.
        reason: String,
    },

    /// A write was issued against a read-only node.
    #[error("node '{0}' is read-only")]
    ReadOnly(String),
}

impl BlockError {
    /// Builds an [`BlockError::Io`] from a kind and message.
    pub fn io(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Io {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` for out-of-space failures.
    #[must_use]
    pub const fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

impl From<io::Error> for BlockError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::StorageFull {
            return Self::NoSpace;
        }
        Self::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
