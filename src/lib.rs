#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Incremental block-device mirroring.
//!
//! This crate gathers the workspace members behind one dependency:
//!
//! - [`block`]: the device, dirty bitmap, node graph and error policy
//!   interfaces the engine is written against.
//! - [`mirror`]: the mirror job itself and active commit.
//! - [`bandwidth`]: the slice-quota rate limiter and speed string parsing.
//! - [`logging`]: installation of the `tracing` subscriber.
//!
//! The most common entry points are re-exported at the top level.
//!
//! ```ignore
//! use std::num::NonZeroU64;
//!
//! use blkmirror::{MirrorConfig, MirrorJob, parse_speed};
//!
//! let speed = parse_speed("64M")?.map_or(0, NonZeroU64::get);
//! let config = MirrorConfig::default().with_speed(speed);
//! let handle = MirrorJob::new(source, target, graph).config(config).start()?;
//! ```

pub use bandwidth;
pub use block;
pub use logging;
pub use mirror;

pub use bandwidth::{parse_size, parse_speed};
pub use block::{BlockDevice, BlockError, DirtyBitmap, NodeGraph, OnErrorPolicy};
pub use logging::{LogConfig, LoggingError};
#[cfg(feature = "tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "tracing")))]
pub use logging::init_tracing;
pub use mirror::{
    CommitConfig, JobEnd, JobHandle, JobOutcome, JobStatus, MirrorConfig, MirrorError, MirrorJob, SyncMode,
    commit_active_start,
};
