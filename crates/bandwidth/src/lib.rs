//! Rate limiting primitives used to pace background copy jobs.
//!
//! The [`RateLimit`] type splits time into fixed slices and grants each slice
//! a byte quota derived from the configured speed. Callers account every
//! dispatched chunk and receive the delay they must wait before issuing more
//! work; the limiter itself never sleeps, so the caller decides how the delay
//! interacts with cancellation.
//!
//! Speeds and sizes arrive from configuration as human readable strings such
//! as `"64M"` or `"1.5GiB"`; [`parse_speed`] and [`parse_size`] turn them into
//! byte counts.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod limiter;
mod parse;

pub use crate::limiter::{DEFAULT_SLICE, RateLimit};
pub use crate::parse::{SizeParseError, parse_size, parse_speed};
