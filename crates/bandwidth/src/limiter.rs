use std::time::{Duration, Instant};

/// Default length of one accounting slice.
pub const DEFAULT_SLICE: Duration = Duration::from_millis(100);

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Slice-quota limiter.
///
/// Time is divided into slices of fixed length. Each slice may dispatch up to
/// `speed * slice` bytes. Once a request would overflow the quota, the limiter
/// carries the excess into the next slice and reports how long the caller has
/// to wait for that slice to begin. A request larger than the whole quota is
/// always admitted when the slice is still empty, so oversized chunks make
/// progress instead of stalling forever.
///
/// The limiter never reads the clock itself; callers pass `now` so paced
/// loops can run against a virtual clock.
#[derive(Clone, Debug)]
pub struct RateLimit {
    bytes_per_second: u64,
    slice: Duration,
    slice_quota: u64,
    next_slice: Option<Instant>,
    dispatched: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl RateLimit {
    /// Constructs a limiter that never delays.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            bytes_per_second: 0,
            slice: DEFAULT_SLICE,
            slice_quota: 0,
            next_slice: None,
            dispatched: 0,
        }
    }

    /// Constructs a limiter for `bytes_per_second` using [`DEFAULT_SLICE`].
    ///
    /// A speed of zero disables throttling.
    #[must_use]
    pub fn new(bytes_per_second: u64) -> Self {
        let mut limit = Self::unlimited();
        limit.set_speed(bytes_per_second, DEFAULT_SLICE);
        limit
    }

    /// Reconfigures speed and slice length. Accounting restarts on the next
    /// request.
    pub fn set_speed(&mut self, bytes_per_second: u64, slice: Duration) {
        let slice = if slice.is_zero() { DEFAULT_SLICE } else { slice };
        let quota = u128::from(bytes_per_second).saturating_mul(slice.as_nanos()) / NANOS_PER_SECOND;

        self.bytes_per_second = bytes_per_second;
        self.slice = slice;
        self.slice_quota = u64::try_from(quota).unwrap_or(u64::MAX).max(1);
        self.next_slice = None;
        self.dispatched = 0;
    }

    /// Returns the configured speed in bytes per second; zero means unlimited.
    #[must_use]
    pub const fn speed(&self) -> u64 {
        self.bytes_per_second
    }

    /// Returns `true` when no throttling is applied.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.bytes_per_second == 0
    }

    /// Returns the slice length.
    #[must_use]
    pub const fn slice(&self) -> Duration {
        self.slice
    }

    /// Returns the number of bytes each slice admits.
    #[must_use]
    pub const fn slice_quota(&self) -> u64 {
        if self.is_unlimited() {
            u64::MAX
        } else {
            self.slice_quota
        }
    }

    /// Accounts `bytes` dispatched at `now` and returns the delay the caller
    /// should observe before dispatching again.
    pub fn calculate_delay(&mut self, now: Instant, bytes: u64) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        let slice_end = match self.next_slice {
            Some(end) if end > now => end,
            _ => {
                let end = now + self.slice;
                self.next_slice = Some(end);
                self.dispatched = 0;
                end
            }
        };

        let total = self.dispatched.saturating_add(bytes);
        if self.dispatched == 0 || total <= self.slice_quota {
            self.dispatched = total;
            return Duration::ZERO;
        }

        // The overflow is carried into the following slice, at most one
        // slice worth so a single oversized request cannot stall later ones.
        self.next_slice = Some(slice_end + self.slice);
        self.dispatched = (total - self.slice_quota).min(self.slice_quota);
        slice_end.saturating_duration_since(now)
    }

    /// Forgets the current slice while keeping the configuration.
    pub fn reset(&mut self) {
        self.next_slice = None;
        self.dispatched = 0;
    }
}
