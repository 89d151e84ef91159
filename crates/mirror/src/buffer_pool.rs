//! Fixed pool of chunk-sized copy buffers.
//!
//! The pool is carved into `buf_size / granularity` buffers once, when the
//! job starts, and never grows. Buffers leave the pool with a work unit and
//! come back when that unit's completion is handled on the job task, so the
//! pool is owned by the driver and needs no lock.
//!
//! Running dry is the normal backpressure signal: [`BufferPool::acquire`]
//! returns `None` and the caller waits for a completion.

use crate::error::MirrorError;

/// Stack of equally sized buffers.
#[derive(Debug)]
pub struct BufferPool {
    /// Free buffers; every entry has capacity for one chunk.
    free: Vec<Vec<u8>>,
    chunk_size: usize,
    capacity: usize,
    peak_checked_out: usize,
}

impl BufferPool {
    /// Allocates `buf_size / chunk_size` buffers of `chunk_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::InvalidParameter`] when the sizes are
    /// inconsistent or the memory cannot be reserved.
    pub fn new(buf_size: u64, chunk_size: u64) -> Result<Self, MirrorError> {
        if chunk_size == 0 || buf_size < chunk_size {
            return Err(MirrorError::invalid(
                "buf-size",
                format!("{buf_size} bytes cannot hold one {chunk_size} byte chunk"),
            ));
        }
        let chunk = usize::try_from(chunk_size)
            .map_err(|_| MirrorError::invalid("granularity", "does not fit in memory"))?;
        let count = usize::try_from(buf_size / chunk_size)
            .map_err(|_| MirrorError::invalid("buf-size", "does not fit in memory"))?;

        let out_of_memory = |_| MirrorError::invalid("buf-size", format!("cannot allocate {buf_size} bytes"));
        let mut free = Vec::new();
        free.try_reserve_exact(count).map_err(out_of_memory)?;
        for _ in 0..count {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(chunk).map_err(out_of_memory)?;
            buffer.resize(chunk, 0);
            free.push(buffer);
        }

        Ok(Self {
            free,
            chunk_size: chunk,
            capacity: count,
            peak_checked_out: 0,
        })
    }

    /// Size of one buffer.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total number of buffers.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently available.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Buffers currently handed out.
    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.capacity - self.free.len()
    }

    /// Highest number of buffers ever handed out at once.
    #[must_use]
    pub const fn peak_checked_out(&self) -> usize {
        self.peak_checked_out
    }

    /// Number of buffers needed to cover `len` bytes.
    #[must_use]
    pub fn chunks_for(&self, len: u64) -> usize {
        let chunk = self.chunk_size as u64;
        usize::try_from(len.div_ceil(chunk)).unwrap_or(usize::MAX)
    }

    /// Hands out buffers covering exactly `len` bytes: full chunks followed
    /// by a tail truncated to the remaining byte count.
    ///
    /// Returns `None` without side effects when not enough buffers are free.
    pub fn acquire(&mut self, len: u64) -> Option<Vec<Vec<u8>>> {
        let needed = self.chunks_for(len);
        if needed > self.free.len() {
            return None;
        }

        let mut remaining = len;
        let at = self.free.len() - needed;
        let mut buffers: Vec<Vec<u8>> = self.free.drain(at..).collect();
        for buffer in &mut buffers {
            let take = remaining.min(self.chunk_size as u64);
            // `take` never exceeds `chunk_size`, which came from a usize.
            buffer.truncate(take as usize);
            remaining -= take;
        }

        self.peak_checked_out = self.peak_checked_out.max(self.checked_out());
        Some(buffers)
    }

    /// Returns buffers to the pool.
    ///
    /// Buffers that did not come from this pool are dropped instead of being
    /// adopted, so the pool never exceeds its initial size.
    pub fn release(&mut self, buffers: Vec<Vec<u8>>) {
        for mut buffer in buffers {
            if self.free.len() == self.capacity || buffer.capacity() < self.chunk_size {
                debug_assert!(false, "foreign buffer returned to pool");
                continue;
            }
            buffer.resize(self.chunk_size, 0);
            self.free.push(buffer);
        }
    }
}
