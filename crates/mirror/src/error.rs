//! Errors surfaced by mirror jobs.

use block::BlockError;
use thiserror::Error;

use crate::config::SyncMode;

/// Failure to start, complete or run a mirror job.
///
/// Setup problems (`InvalidParameter`, `Busy`, `TwoBackends`,
/// `UnsupportedSyncMode`, `NodeNotFound`) are returned synchronously before
/// the job runs. `NotReady` and `Finished` answer a premature or a late
/// completion request. `Io` and `Reopen` are final job statuses.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum MirrorError {
    /// A start parameter is out of range or inconsistent.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name as accepted by the configuration.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A node involved in the job is blocked by another operation.
    #[error("node '{node}' is busy: {reason}")]
    Busy {
        /// Name of the blocked node.
        node: String,
        /// Reason recorded by the blocker.
        reason: String,
    },

    /// Both the replaced node and the target have a guest backend attached.
    #[error("can't create node with two backends")]
    TwoBackends,

    /// The requested sync mode is not implemented.
    #[error("sync mode '{0}' is not supported")]
    UnsupportedSyncMode(SyncMode),

    /// Completion was requested before the job converged.
    #[error("the active block job '{job}' cannot be completed")]
    NotReady {
        /// Job identifier.
        job: String,
    },

    /// Completion was requested after the job delivered its final status.
    #[error("block job '{job}' has already finished")]
    Finished {
        /// Job identifier.
        job: String,
    },

    /// The node named by `replaces` does not exist.
    #[error("node name '{0}' not found")]
    NodeNotFound(String),

    /// An I/O operation failed and the error policy reported it.
    #[error("{op} failed: {source}")]
    Io {
        /// Operation that failed.
        op: &'static str,
        /// Underlying device error.
        #[source]
        source: BlockError,
    },

    /// The job was torn down before it produced a status.
    #[error("job was cancelled")]
    Cancelled,

    /// The target could not be reopened with the replaced node's flags.
    #[error("failed to reopen '{node}': {source}")]
    Reopen {
        /// Name of the node being reopened.
        node: String,
        /// Underlying device error.
        #[source]
        source: BlockError,
    },
}

impl MirrorError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) const fn io(op: &'static str, source: BlockError) -> Self {
        Self::Io { op, source }
    }

    /// Returns the device error behind an I/O or reopen failure.
    #[must_use]
    pub const fn block_error(&self) -> Option<&BlockError> {
        match self {
            Self::Io { source, .. } | Self::Reopen { source, .. } => Some(source),
            _ => None,
        }
    }
}
