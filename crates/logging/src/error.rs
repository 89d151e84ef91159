//! crates/logging/src/error.rs
//! Subscriber installation errors.

use thiserror::Error;

/// Failure to install the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// A filter directive could not be parsed.
    #[error("invalid log filter '{directives}': {reason}")]
    InvalidDirective {
        /// The directives as given.
        directives: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialised,
}
