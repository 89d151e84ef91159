//! Work unit selection.
//!
//! The planner walks the dirty bitmap with a cursor and grows one contiguous
//! run of dirty chunks per call. A run stops at the first clean or in-flight
//! chunk and whenever buffers, the device fragment limit or the rate limit
//! say so. Copy-on-write targets widen the first copy into a cluster to the
//! whole cluster, which may move the start of a run backwards before the
//! chunk the cursor found.
//!
//! When the run cannot start at all the planner remembers the chunk it found
//! and returns a wait verdict; the next call resumes from that chunk.

use std::time::{Duration, Instant};

use bandwidth::RateLimit;
use block::{DirtyBitmap, DirtyIter};

use crate::buffer_pool::BufferPool;
use crate::inflight::InFlightTracker;
use crate::trace;

/// A contiguous range reserved for one copy operation.
///
/// The unit owns its buffers between dispatch and completion; the chunks it
/// covers are marked in flight for the same span.
#[derive(Debug)]
pub struct WorkUnit {
    /// Start offset in bytes, chunk aligned.
    pub offset: u64,
    /// Length in bytes; only the last chunk of the device may be partial.
    pub len: u64,
    /// Buffers covering `len` bytes in order.
    pub buffers: Vec<Vec<u8>>,
}

impl WorkUnit {
    /// Offset one past the last byte of the unit.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Result of one planning step.
#[derive(Debug)]
pub enum Plan {
    /// A unit was reserved. `delay` is the pacing the rate limit asks for
    /// before the next dispatch.
    Dispatch {
        /// The reserved unit.
        unit: WorkUnit,
        /// Pacing delay accrued while building the unit.
        delay: Duration,
    },
    /// The next dirty chunk is still being copied.
    WaitInFlight,
    /// Not enough free buffers to start a unit.
    WaitBuffers,
    /// Nothing is dirty.
    Idle,
}

/// Inputs the planner borrows from the job for one step.
pub struct PlanContext<'a> {
    /// Chunks that differ from the target.
    pub dirty: &'a DirtyBitmap,
    /// Chunks being copied.
    pub in_flight: &'a mut InFlightTracker,
    /// Copy buffers.
    pub pool: &'a mut BufferPool,
    /// Rate limit and the current time, when pacing applies.
    pub limit: Option<(&'a mut RateLimit, Instant)>,
    /// Fragment limit of the devices.
    pub max_iov: usize,
    /// Device length in bytes.
    pub length: u64,
}

/// Cursor state carried across planning steps.
#[derive(Debug)]
pub struct Planner {
    job: String,
    iter: DirtyIter,
    pending: Option<u64>,
    restarts: u64,
}

impl Planner {
    /// Creates a planner over `dirty`.
    #[must_use]
    pub fn new(job: impl Into<String>, dirty: &DirtyBitmap) -> Self {
        Self {
            job: job.into(),
            iter: dirty.iter(),
            pending: None,
            restarts: 0,
        }
    }

    /// Number of times the cursor wrapped around to the first chunk.
    #[must_use]
    pub const fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Chunk the next step resumes from after a wait verdict.
    #[must_use]
    pub const fn pending(&self) -> Option<u64> {
        self.pending
    }

    fn next_candidate(&mut self, dirty: &DirtyBitmap) -> Option<u64> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }
        if let Some(chunk) = self.iter.next_dirty() {
            return Some(chunk);
        }
        trace::trace_restart_iter(&self.job, dirty.count());
        self.restarts += 1;
        self.iter.restart();
        self.iter.next_dirty()
    }

    /// Plans the next work unit.
    pub fn plan(&mut self, ctx: PlanContext<'_>) -> Plan {
        let PlanContext {
            dirty,
            in_flight,
            pool,
            mut limit,
            max_iov,
            length,
        } = ctx;
        let granularity = in_flight.granularity();
        let total = in_flight.total_chunks();
        let chunk_end = |chunk: u64| chunk.saturating_mul(granularity).min(length);

        let first = loop {
            let Some(chunk) = self.next_candidate(dirty) else {
                return Plan::Idle;
            };
            // A pending chunk may have been copied by a unit that widened
            // over it; look for the next one.
            if dirty.test_chunk(chunk) {
                break chunk;
            }
        };

        if in_flight.is_in_flight(first) {
            trace::trace_yield_in_flight(&self.job, first * granularity, in_flight.ops());
            self.pending = Some(first);
            return Plan::WaitInFlight;
        }

        let mut start = first;
        let mut chunks = 0u64;
        let mut bytes = 0u64;
        let mut next = first;
        let mut delay = Duration::ZERO;

        loop {
            if chunks > 0 && (!dirty.test_chunk(next) || in_flight.is_in_flight(next)) {
                break;
            }

            let mut add_start = next;
            let mut add_end = next + 1;
            if let Some(cluster) = in_flight.cow_cluster_chunks()
                && in_flight.needs_cow(next)
            {
                let cluster_start = next - next % cluster;
                if cluster_start < next && chunks > 0 {
                    // Whole clusters are copied at once, so a run can only
                    // cross into an unwidened cluster at its boundary.
                    debug_assert!(false, "cluster rewind after the first chunk");
                    trace::trace_invariant_violation(&self.job, "cluster rewind after the first chunk", next);
                    break;
                }
                add_start = cluster_start;
                add_end = cluster_start + cluster;
            }
            add_end = add_end.min(total);
            let added_chunks = add_end - add_start;

            if in_flight.any_in_flight(add_start, added_chunks) {
                if chunks == 0 {
                    trace::trace_yield_in_flight(&self.job, add_start * granularity, in_flight.ops());
                    self.pending = Some(first);
                    return Plan::WaitInFlight;
                }
                break;
            }

            let needed = usize::try_from(chunks + added_chunks).unwrap_or(usize::MAX);
            if pool.free_count() < needed {
                trace::trace_buf_starved(&self.job, pool.free_count(), in_flight.ops(), chunks == 0);
                if chunks == 0 {
                    self.pending = Some(first);
                    return Plan::WaitBuffers;
                }
                break;
            }
            if needed > max_iov {
                trace::trace_break_iov(&self.job, needed, max_iov);
                break;
            }

            let added_bytes = chunk_end(add_end) - add_start * granularity;
            if chunks == 0 {
                start = add_start;
            }
            chunks += added_chunks;
            bytes += added_bytes;
            next = add_end;

            if let Some((rate, now)) = limit.as_mut() {
                delay = rate.calculate_delay(*now, added_bytes);
            }
            if !delay.is_zero() || next >= total {
                break;
            }
        }

        if chunks == 0 {
            // Only reachable when the fragment limit is below one cluster,
            // which job setup rejects.
            self.pending = Some(first);
            return Plan::WaitBuffers;
        }

        let offset = start * granularity;
        let Some(buffers) = pool.acquire(bytes) else {
            self.pending = Some(first);
            return Plan::WaitBuffers;
        };

        // Advance the cursor past the reserved run so no chunk is examined
        // twice in one pass.
        let position = self.iter.position().max(next);
        self.iter.skip_to(position);

        dirty.reset(offset, bytes);
        in_flight.reserve(start, chunks, bytes);

        Plan::Dispatch {
            unit: WorkUnit {
                offset,
                len: bytes,
                buffers,
            },
            delay,
        }
    }
}
