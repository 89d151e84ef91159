#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! crates/mirror/src/lib.rs
//!
//! Incremental block mirroring.
//!
//! A mirror job copies a live source device onto a target while the guest
//! keeps writing to the source. Writes land in a dirty bitmap; the job keeps
//! copying dirty chunks until nothing is left, signals readiness, and then
//! keeps the two devices converged until it is told to complete (the target
//! replaces the source in the node graph) or cancelled.
//!
//! # Moving parts
//!
//! - [`planner::Planner`] walks the dirty bitmap and turns contiguous dirty
//!   chunks into [`planner::WorkUnit`]s, bounded by free buffers, chunks
//!   already in flight, the device fragment limit and the rate limit.
//! - [`buffer_pool::BufferPool`] owns the fixed set of chunk buffers.
//! - [`inflight::InFlightTracker`] guarantees no chunk is copied twice at the
//!   same time, and widens units to whole target clusters when the target
//!   would otherwise read back stale data.
//! - [`dispatch`] picks copy, zero-write or discard from the source
//!   allocation status and runs each unit on its own task.
//! - [`MirrorJob`] validates the parameters and spawns the job; the returned
//!   [`JobHandle`] pauses, resumes, throttles, completes and cancels it.
//! - [`commit_active_start`] reuses the job to merge a live overlay into one
//!   of its backing nodes.
//!
//! # Example
//!
//! ```ignore
//! use mirror::{JobEnd, MirrorConfig, MirrorJob};
//!
//! let handle = MirrorJob::new(source, target, graph)
//!     .config(MirrorConfig::default().with_granularity(64 * 1024))
//!     .start()?;
//! if handle.ready().await {
//!     handle.complete().await?;
//! }
//! assert!(matches!(handle.wait().await?.end, JobEnd::Pivoted { .. }));
//! ```
//!
//! # Features
//!
//! - `tracing` (default): trace points under the `blkmirror::mirror` target.
//! - `serde`: (de)serialisation of [`MirrorConfig`] and the status types.

/// Fixed pool of chunk sized copy buffers.
pub mod buffer_pool;
/// Active commit of an overlay into its backing chain.
mod commit;
/// Completion requests and the final handoff.
mod completion;
/// Job parameters and their validation.
pub mod config;
/// Copy method selection and I/O tasks.
pub mod dispatch;
/// Error type.
mod error;
/// Chunks currently being copied.
pub mod inflight;
/// Job setup, driver and control handle.
mod job;
/// Work unit planning over the dirty bitmap.
pub mod planner;
/// Trace points.
mod trace;

pub use crate::commit::{CommitConfig, commit_active_start};
pub use crate::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IN_FLIGHT, DEFAULT_SLICE_TIME, MAX_GRANULARITY, MIN_GRANULARITY, MirrorConfig,
    SyncMode, default_granularity,
};
pub use crate::error::MirrorError;
pub use crate::job::{CompletionCallback, JobEnd, JobHandle, JobOutcome, JobStatus, MirrorJob, MirrorStats};
