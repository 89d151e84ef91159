//! Chunks currently being copied.
//!
//! The tracker owns the in-flight bitmap, the optional copy-on-write bitmap
//! and the outstanding operation counters. Only the job task touches it: the
//! planner reserves ranges, completion handling releases them.

use block::ChunkBitmap;

/// Copy-on-write bookkeeping for targets that cannot fill partial clusters
/// from a backing file.
#[derive(Debug)]
struct CowBitmap {
    /// Chunks whose whole cluster has been written to the target.
    done: ChunkBitmap,
    cluster_chunks: u64,
}

/// In-flight bitmap and counters.
#[derive(Debug)]
pub struct InFlightTracker {
    granularity: u64,
    chunks: ChunkBitmap,
    cow: Option<CowBitmap>,
    ops: usize,
    bytes: u64,
    peak_ops: usize,
    peak_chunks: u64,
}

impl InFlightTracker {
    /// Creates a tracker for `length` bytes split into `granularity` chunks.
    ///
    /// `cow_cluster` enables the copy-on-write bitmap: first copies into a
    /// cluster are widened to the whole cluster.
    #[must_use]
    pub fn new(granularity: u64, length: u64, cow_cluster: Option<u64>) -> Self {
        let total = length.div_ceil(granularity);
        Self {
            granularity,
            chunks: ChunkBitmap::new(total),
            cow: cow_cluster.map(|cluster| CowBitmap {
                done: ChunkBitmap::new(total),
                cluster_chunks: (cluster / granularity).max(1),
            }),
            ops: 0,
            bytes: 0,
            peak_ops: 0,
            peak_chunks: 0,
        }
    }

    /// Chunk size in bytes.
    #[must_use]
    pub const fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Number of chunks covering the device.
    #[must_use]
    pub const fn total_chunks(&self) -> u64 {
        self.chunks.len()
    }

    /// Returns `true` while chunk `index` is being copied.
    #[must_use]
    pub fn is_in_flight(&self, index: u64) -> bool {
        self.chunks.test(index)
    }

    /// Returns `true` if any of `count` chunks from `start` is being copied.
    #[must_use]
    pub fn any_in_flight(&self, start: u64, count: u64) -> bool {
        self.chunks.any_in_range(start, count)
    }

    /// Cluster size in chunks, when the copy-on-write bitmap is active.
    #[must_use]
    pub fn cow_cluster_chunks(&self) -> Option<u64> {
        self.cow.as_ref().map(|cow| cow.cluster_chunks)
    }

    /// Returns `true` if chunk `index` must be widened to its cluster.
    #[must_use]
    pub fn needs_cow(&self, index: u64) -> bool {
        self.cow.as_ref().is_some_and(|cow| !cow.done.test(index))
    }

    /// Marks `count` chunks from `start` as in flight for one operation
    /// covering `bytes`.
    pub fn reserve(&mut self, start: u64, count: u64, bytes: u64) {
        debug_assert!(!self.chunks.any_in_range(start, count), "overlapping reservation");
        self.chunks.set_range(start, count);
        self.ops += 1;
        self.bytes += bytes;
        self.peak_ops = self.peak_ops.max(self.ops);
        self.peak_chunks = self.peak_chunks.max(self.chunks.count());
    }

    /// Releases the operation covering `len` bytes at `offset`. On success
    /// the range is recorded in the copy-on-write bitmap.
    pub fn finish(&mut self, offset: u64, len: u64, copied: bool) {
        let start = offset / self.granularity;
        let count = (offset + len).div_ceil(self.granularity) - start;
        self.chunks.clear_range(start, count);
        self.ops = self.ops.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(len);

        if copied && let Some(cow) = self.cow.as_mut() {
            cow.done.set_range(start, count);
        }
    }

    /// Outstanding operations.
    #[must_use]
    pub const fn ops(&self) -> usize {
        self.ops
    }

    /// Outstanding bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Chunks currently marked in flight.
    #[must_use]
    pub fn chunks_in_flight(&self) -> u64 {
        self.chunks.count()
    }

    /// Highest number of concurrently outstanding operations.
    #[must_use]
    pub const fn peak_ops(&self) -> usize {
        self.peak_ops
    }

    /// Highest number of chunks in flight at once.
    #[must_use]
    pub const fn peak_chunks(&self) -> u64 {
        self.peak_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: u64 = 64 * 1024;

    #[test]
    fn reserve_and_finish_balance() {
        let mut tracker = InFlightTracker::new(G, 10 * G, None);
        tracker.reserve(2, 3, 3 * G);
        assert!(tracker.is_in_flight(2));
        assert!(tracker.is_in_flight(4));
        assert!(!tracker.is_in_flight(5));
        assert_eq!(tracker.ops(), 1);
        assert_eq!(tracker.bytes(), 3 * G);

        tracker.finish(2 * G, 3 * G, true);
        assert_eq!(tracker.ops(), 0);
        assert_eq!(tracker.bytes(), 0);
        assert_eq!(tracker.chunks_in_flight(), 0);
        assert_eq!(tracker.peak_chunks(), 3);
    }

    #[test]
    fn partial_tail_chunk_is_cleared() {
        let mut tracker = InFlightTracker::new(G, 2 * G + 100, None);
        assert_eq!(tracker.total_chunks(), 3);
        tracker.reserve(2, 1, 100);
        tracker.finish(2 * G, 100, true);
        assert!(!tracker.is_in_flight(2));
    }

    #[test]
    fn cow_bits_only_set_on_success() {
        let mut tracker = InFlightTracker::new(G, 32 * G, Some(16 * G));
        assert_eq!(tracker.cow_cluster_chunks(), Some(16));
        assert!(tracker.needs_cow(3));

        tracker.reserve(0, 16, 16 * G);
        tracker.finish(0, 16 * G, false);
        assert!(tracker.needs_cow(3));

        tracker.reserve(0, 16, 16 * G);
        tracker.finish(0, 16 * G, true);
        assert!(!tracker.needs_cow(3));
        assert!(tracker.needs_cow(16));
    }

    #[test]
    fn without_cow_nothing_needs_widening() {
        let tracker = InFlightTracker::new(G, 4 * G, None);
        assert!(!tracker.needs_cow(0));
        assert_eq!(tracker.cow_cluster_chunks(), None);
    }

    #[test]
    fn peak_ops_tracks_concurrency() {
        let mut tracker = InFlightTracker::new(G, 8 * G, None);
        tracker.reserve(0, 1, G);
        tracker.reserve(1, 1, G);
        tracker.reserve(2, 1, G);
        tracker.finish(G, G, true);
        assert_eq!(tracker.peak_ops(), 3);
        assert!(tracker.any_in_flight(0, 3));
        assert!(!tracker.any_in_flight(1, 1));
    }
}
