//! crates/logging/src/subscriber.rs
//! Installation of the formatting subscriber.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogConfig;
use crate::error::LoggingError;

/// Builds the event filter for `config`, consulting `RUST_LOG` when the
/// configuration has no directives of its own.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = config.effective_directives(env.as_deref());
    EnvFilter::try_new(&directives).map_err(|error| LoggingError::InvalidDirective {
        reason: error.to_string(),
        directives,
    })
}

/// Installs a formatting subscriber filtered according to `config`.
///
/// Only the first successful call in a process takes effect.
pub fn init_tracing(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let format = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialised)
}
