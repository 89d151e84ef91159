#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Collaborator interfaces for block-level mirroring.
//!
//! The mirror engine never touches storage directly. Everything it needs from
//! the outside world is expressed here:
//!
//! - [`BlockDevice`]: asynchronous read/write/flush/discard/zero-write plus
//!   allocation status queries, reopen and operation blockers.
//! - [`DirtyBitmap`]: a shared chunk-granular bitmap that guest writes mark
//!   and the engine drains through a [`DirtyIter`] cursor.
//! - [`OnErrorPolicy`]: maps an I/O failure to an [`ErrorAction`].
//! - [`NodeGraph`]: name lookup and atomic node substitution.
//!
//! [`ChunkBitmap`] is the plain word bitmap used by both the dirty bitmap and
//! the engine's private bookkeeping.
//!
//! With the `test-support` feature the [`testing`] module provides an
//! in-memory disk with fault injection and an in-memory node graph.

mod bitmap;
mod blockers;
mod device;
mod dirty;
mod error;
mod graph;
mod policy;

#[cfg(feature = "test-support")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod testing;

pub use crate::bitmap::ChunkBitmap;
pub use crate::blockers::{BlockOp, BlockerId, OpBlockers};
pub use crate::device::{BlockDevice, BlockStatus, DEFAULT_MAX_IOV, DeviceInfo, OpenFlags};
pub use crate::dirty::{DirtyBitmap, DirtyIter, DirtyRegistry};
pub use crate::error::BlockError;
pub use crate::graph::NodeGraph;
pub use crate::policy::{ErrorAction, OnErrorPolicy, PolicyParseError};
