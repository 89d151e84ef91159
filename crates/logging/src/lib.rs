#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Overview
//!
//! `logging` installs the process-wide `tracing` subscriber used by programs
//! embedding the mirror engine. The engine itself only emits events under
//! the `blkmirror::mirror` target; which of them reach the output is decided
//! here.
//!
//! # Design
//!
//! [`LogConfig`] carries either explicit filter directives or a verbosity
//! level that maps to a default directive set. With neither, the `RUST_LOG`
//! environment variable is honoured. [`init_tracing`] builds an
//! `EnvFilter` plus a formatting layer and installs them once.
//!
//! # Examples
//!
//! ```ignore
//! use logging::{LogConfig, init_tracing};
//!
//! init_tracing(&LogConfig::from_verbose_level(2).with_ansi(false))?;
//! tracing::debug!(target: "blkmirror::mirror", "subscriber ready");
//! ```

mod config;
mod error;
#[cfg(feature = "tracing")]
mod subscriber;

pub use crate::config::{LogConfig, MIRROR_TARGET, verbosity_directives};
pub use crate::error::LoggingError;
#[cfg(feature = "tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "tracing")))]
pub use crate::subscriber::{build_filter, init_tracing};
