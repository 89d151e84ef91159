//! Work unit execution.
//!
//! The job task picks how a unit is copied by asking the source for the
//! allocation status of the range, then hands the unit to a spawned I/O task.
//! That task runs the read and the paired write strictly in sequence and
//! reports back over a channel; it never touches job state, so all
//! bookkeeping stays on the job task.

use std::sync::Arc;

use block::{BlockDevice, BlockError};
use tokio::sync::mpsc::UnboundedSender;

use crate::planner::WorkUnit;

/// How a work unit reaches the target.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CopyMethod {
    /// Read from the source, then write the data to the target.
    Copy,
    /// Write zeroes on the target without reading the source.
    Zero,
    /// Discard the range on the target.
    Discard,
}

impl CopyMethod {
    /// Short name for traces.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Zero => "zero",
            Self::Discard => "discard",
        }
    }
}

/// Device a failed request was issued to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Side {
    /// The mirrored device.
    Source,
    /// The copy.
    Target,
}

/// A failed request of a work unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoFailure {
    /// Device the request went to.
    pub side: Side,
    /// Request name.
    pub op: &'static str,
    /// Device error.
    pub error: BlockError,
}

/// Message sent by an I/O task when its unit is finished.
#[derive(Debug)]
pub struct Completion {
    /// The unit, with its buffers.
    pub unit: WorkUnit,
    /// How it was copied.
    pub method: CopyMethod,
    /// Outcome of the unit's requests.
    pub result: Result<(), IoFailure>,
}

/// Picks the copy method for `len` bytes at `offset` from the source's
/// allocation status, looking through the whole backing chain.
///
/// Anything that is not known to read as zero or to be unallocated for the
/// whole range is copied; a failed status query falls back to copying too.
pub async fn choose_method(source: &dyn BlockDevice, offset: u64, len: u64) -> CopyMethod {
    match source.block_status_above(None, offset, len).await {
        Ok(status) if status.extent >= len && !(status.data && !status.zero) => {
            if status.zero {
                CopyMethod::Zero
            } else {
                CopyMethod::Discard
            }
        }
        _ => CopyMethod::Copy,
    }
}

/// Runs `unit` on its own task and sends the [`Completion`] to `done`.
pub fn spawn_unit(
    source: Arc<dyn BlockDevice>,
    target: Arc<dyn BlockDevice>,
    mut unit: WorkUnit,
    method: CopyMethod,
    unmap: bool,
    done: UnboundedSender<Completion>,
) {
    tokio::spawn(async move {
        let result = run_unit(source.as_ref(), target.as_ref(), &mut unit, method, unmap).await;
        // The job task keeps its receiver until every unit has reported.
        let _ = done.send(Completion { unit, method, result });
    });
}

async fn run_unit(
    source: &dyn BlockDevice,
    target: &dyn BlockDevice,
    unit: &mut WorkUnit,
    method: CopyMethod,
    unmap: bool,
) -> Result<(), IoFailure> {
    match method {
        CopyMethod::Copy => {
            {
                let mut bufs: Vec<&mut [u8]> = unit.buffers.iter_mut().map(Vec::as_mut_slice).collect();
                source
                    .readv(unit.offset, &mut bufs)
                    .await
                    .map_err(failed(Side::Source, "read"))?;
            }
            let bufs: Vec<&[u8]> = unit.buffers.iter().map(Vec::as_slice).collect();
            target
                .writev(unit.offset, &bufs)
                .await
                .map_err(failed(Side::Target, "write"))
        }
        CopyMethod::Zero => target
            .write_zeroes(unit.offset, unit.len, unmap)
            .await
            .map_err(failed(Side::Target, "write-zeroes")),
        CopyMethod::Discard => target
            .discard(unit.offset, unit.len)
            .await
            .map_err(failed(Side::Target, "discard")),
    }
}

fn failed(side: Side, op: &'static str) -> impl FnOnce(BlockError) -> IoFailure {
    move |error| IoFailure { side, op, error }
}
