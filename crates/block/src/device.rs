//! The block device abstraction.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::blockers::OpBlockers;
use crate::dirty::{DirtyBitmap, DirtyRegistry};
use crate::error::BlockError;

/// Buffer fragments a device accepts in one vectored request unless it says
/// otherwise.
pub const DEFAULT_MAX_IOV: usize = 1024;

/// Flags a node is opened with.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct OpenFlags {
    /// Writes are refused.
    pub read_only: bool,
    /// Host page cache is bypassed.
    pub direct: bool,
}

impl OpenFlags {
    /// Read-write flags.
    pub const READ_WRITE: Self = Self {
        read_only: false,
        direct: false,
    };

    /// Read-only flags.
    pub const READ_ONLY: Self = Self {
        read_only: true,
        direct: false,
    };
}

/// Static geometry of a device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    /// Allocation unit of the image format, if it has one.
    pub cluster_size: Option<u64>,
}

/// Allocation status of the run starting at a queried offset.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockStatus {
    /// The run holds data that must be read.
    pub data: bool,
    /// The run reads as zeroes.
    pub zero: bool,
    /// The run is allocated in one of the layers examined.
    pub allocated: bool,
    /// Length in bytes of the run sharing this status. Never zero for a
    /// non-empty query and never longer than the query.
    pub extent: u64,
}

impl BlockStatus {
    /// Status for a run that holds data.
    #[must_use]
    pub const fn data(extent: u64) -> Self {
        Self {
            data: true,
            zero: false,
            allocated: true,
            extent,
        }
    }

    /// Status for an allocated run that reads as zeroes.
    #[must_use]
    pub const fn zero(extent: u64) -> Self {
        Self {
            data: false,
            zero: true,
            allocated: true,
            extent,
        }
    }

    /// Status for an unallocated run.
    #[must_use]
    pub const fn unallocated(extent: u64) -> Self {
        Self {
            data: false,
            zero: false,
            allocated: false,
            extent,
        }
    }
}

/// A node in the block graph.
///
/// Offsets and lengths are bytes. Vectored requests treat the fragments as
/// one contiguous buffer starting at `offset`.
///
/// Methods with default bodies describe a plain node without a backing chain
/// and without reopen support; image formats override what they support.
#[async_trait]
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Unique node name.
    fn node_name(&self) -> &str;

    /// Current length in bytes.
    fn length(&self) -> u64;

    /// Format geometry.
    fn info(&self) -> DeviceInfo {
        DeviceInfo::default()
    }

    /// The open backing node, if any.
    fn backing(&self) -> Option<Arc<dyn BlockDevice>> {
        None
    }

    /// Name of the backing file recorded in the image, whether or not it is
    /// currently open.
    fn backing_file_name(&self) -> Option<String> {
        None
    }

    /// Returns `true` if a freshly created node reads as zeroes everywhere.
    fn has_zero_init(&self) -> bool {
        false
    }

    /// Returns `true` if runs unallocated in this layer read as zeroes when
    /// there is no backing node underneath.
    fn unallocated_reads_zero(&self) -> bool {
        true
    }

    /// Maximum number of fragments per vectored request.
    fn max_iov(&self) -> usize {
        DEFAULT_MAX_IOV
    }

    /// Flags the node is currently open with.
    fn flags(&self) -> OpenFlags;

    /// Returns `true` if a guest-facing backend is attached.
    fn has_frontend(&self) -> bool {
        false
    }

    /// Returns `true` if the node records I/O status, which pausing error
    /// policies depend on.
    fn io_status_enabled(&self) -> bool {
        false
    }

    /// Blockers installed on this node.
    fn op_blockers(&self) -> &OpBlockers;

    /// Bitmaps marked by writes to this node.
    fn dirty_bitmaps(&self) -> &DirtyRegistry;

    /// Reads into `bufs`.
    async fn readv(&self, offset: u64, bufs: &mut [&mut [u8]]) -> Result<(), BlockError>;

    /// Writes `bufs`.
    async fn writev(&self, offset: u64, bufs: &[&[u8]]) -> Result<(), BlockError>;

    /// Writes zeroes over `len` bytes. With `may_unmap` the device may
    /// deallocate the range instead.
    async fn write_zeroes(&self, offset: u64, len: u64, may_unmap: bool) -> Result<(), BlockError>;

    /// Hints that `len` bytes are no longer needed.
    async fn discard(&self, offset: u64, len: u64) -> Result<(), BlockError>;

    /// Makes completed writes durable.
    async fn flush(&self) -> Result<(), BlockError>;

    /// Status of this layer alone for the run at `offset`.
    async fn block_status(&self, offset: u64, len: u64) -> Result<BlockStatus, BlockError>;

    /// Status of the run at `offset` looking through the backing chain down
    /// to, but excluding, `base`.
    ///
    /// A run unallocated in every examined layer reads as zero when the
    /// chain ends without reaching `base` and the last layer says so; when
    /// the walk stops at `base` the content is unknown and neither `data` nor
    /// `zero` is set.
    async fn block_status_above(
        &self,
        base: Option<&str>,
        offset: u64,
        len: u64,
    ) -> Result<BlockStatus, BlockError> {
        let status = self.block_status(offset, len).await?;
        if status.allocated {
            return Ok(status);
        }

        match self.backing() {
            Some(backing) if Some(backing.node_name()) != base => {
                let below = backing.block_status_above(base, offset, status.extent).await?;
                Ok(BlockStatus {
                    extent: below.extent.min(status.extent),
                    ..below
                })
            }
            Some(_) => Ok(BlockStatus::unallocated(status.extent)),
            None => Ok(BlockStatus {
                zero: self.unallocated_reads_zero(),
                ..BlockStatus::unallocated(status.extent)
            }),
        }
    }

    /// Returns whether the run at `offset` is allocated in any layer above
    /// `base`, and the length of that run.
    async fn is_allocated_above(
        &self,
        base: Option<&str>,
        offset: u64,
        len: u64,
    ) -> Result<(bool, u64), BlockError> {
        let status = self.block_status_above(base, offset, len).await?;
        Ok((status.allocated, status.extent))
    }

    /// Opens the backing file named in the image if it is not open yet.
    async fn open_backing_file(&self) -> Result<(), BlockError> {
        Ok(())
    }

    /// Reopens the node with new flags.
    async fn reopen(&self, _flags: OpenFlags) -> Result<(), BlockError> {
        Err(BlockError::NotSupported("reopen"))
    }

    /// Changes the device length.
    async fn truncate(&self, _length: u64) -> Result<(), BlockError> {
        Err(BlockError::NotSupported("truncate"))
    }

    /// Waits until every request issued to the node has completed.
    async fn drain(&self) {}

    /// Creates a dirty bitmap that records subsequent writes.
    fn create_dirty_bitmap(&self, granularity: u64) -> Result<DirtyBitmap, BlockError> {
        if granularity == 0 || !granularity.is_power_of_two() {
            return Err(BlockError::NotSupported("dirty bitmap granularity"));
        }
        Ok(self.dirty_bitmaps().create(granularity, self.length()))
    }

    /// Detaches a bitmap created by [`BlockDevice::create_dirty_bitmap`].
    fn release_dirty_bitmap(&self, bitmap: &DirtyBitmap) {
        self.dirty_bitmaps().release(bitmap);
    }
}
