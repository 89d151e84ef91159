//! In-memory collaborators for tests.
//!
//! [`MemDisk`] is a sparse disk with an optional backing chain. Tests drive
//! it like a guest (`fill`, `writev`) and inspect it afterwards (`read_all`,
//! [`MemDisk::io_log`]). Faults are installed with [`MemDisk::inject`];
//! [`MemDisk::hold_io`] parks requests so a test can observe work in flight.
//!
//! [`MemGraph`] resolves node names and records substitutions.

mod disk;
mod graph;

pub use disk::{Fault, IoKind, IoRecord, MemDisk, MemDiskBuilder, SECTOR};
pub use graph::MemGraph;
