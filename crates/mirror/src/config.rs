//! Job parameters.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use block::{BlockDevice, OnErrorPolicy};

use crate::error::MirrorError;

/// Default size of the copy buffer when none is configured.
pub const DEFAULT_BUFFER_SIZE: u64 = 10 * 1024 * 1024;

/// Default cap on concurrently outstanding work units.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Default pacing quantum. The loop yields at least once per slice.
pub const DEFAULT_SLICE_TIME: Duration = Duration::from_millis(100);

/// Smallest accepted chunk size.
pub const MIN_GRANULARITY: u64 = 512;

/// Largest accepted chunk size.
pub const MAX_GRANULARITY: u64 = 64 * 1024 * 1024;

const DEFAULT_GRANULARITY_FLOOR: u64 = 4 * 1024;
const DEFAULT_GRANULARITY_CEIL: u64 = 64 * 1024;

/// Which part of the source is copied before steady state.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum SyncMode {
    /// The whole device.
    #[default]
    Full,
    /// Only data allocated above the source's backing node.
    Top,
    /// Nothing; only writes issued after the job starts are copied.
    None,
    /// Bitmap-driven incremental copy. Rejected at start.
    Incremental,
}

impl SyncMode {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Top => "top",
            Self::None => "none",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = MirrorError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "top" => Ok(Self::Top),
            "none" => Ok(Self::None),
            "incremental" => Ok(Self::Incremental),
            other => Err(MirrorError::invalid("sync", format!("unknown sync mode '{other}'"))),
        }
    }
}

/// Parameters of a mirror job.
///
/// Zero values for `granularity` and `buf_size` select defaults derived from
/// the target when the job starts.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct MirrorConfig {
    /// Copy speed limit in bytes per second; zero is unlimited.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "human::speed"))]
    pub speed: u64,
    /// Chunk size in bytes; zero picks the target's default.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "human::size"))]
    pub granularity: u64,
    /// Copy buffer size in bytes; zero picks [`DEFAULT_BUFFER_SIZE`].
    #[cfg_attr(feature = "serde", serde(deserialize_with = "human::size"))]
    pub buf_size: u64,
    /// Initial synchronisation mode.
    pub sync_mode: SyncMode,
    /// Policy for read errors on the source.
    pub on_source_error: OnErrorPolicy,
    /// Policy for write and flush errors on the target.
    pub on_target_error: OnErrorPolicy,
    /// Allow zeroed regions to be deallocated on the target.
    pub unmap: bool,
    /// Node replaced by the target on completion instead of the source.
    pub replaces: Option<String>,
    /// Cap on concurrently outstanding work units.
    pub max_in_flight: usize,
    /// Pacing quantum.
    #[cfg_attr(feature = "serde", serde(with = "human::millis"))]
    pub slice_time: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            speed: 0,
            granularity: 0,
            buf_size: 0,
            sync_mode: SyncMode::Full,
            on_source_error: OnErrorPolicy::Report,
            on_target_error: OnErrorPolicy::Report,
            unmap: true,
            replaces: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            slice_time: DEFAULT_SLICE_TIME,
        }
    }
}

impl MirrorConfig {
    /// Sets the speed limit in bytes per second.
    #[must_use]
    pub const fn with_speed(mut self, speed: u64) -> Self {
        self.speed = speed;
        self
    }

    /// Sets the chunk size.
    #[must_use]
    pub const fn with_granularity(mut self, granularity: u64) -> Self {
        self.granularity = granularity;
        self
    }

    /// Sets the copy buffer size.
    #[must_use]
    pub const fn with_buf_size(mut self, buf_size: u64) -> Self {
        self.buf_size = buf_size;
        self
    }

    /// Sets the sync mode.
    #[must_use]
    pub const fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the source error policy.
    #[must_use]
    pub const fn with_on_source_error(mut self, policy: OnErrorPolicy) -> Self {
        self.on_source_error = policy;
        self
    }

    /// Sets the target error policy.
    #[must_use]
    pub const fn with_on_target_error(mut self, policy: OnErrorPolicy) -> Self {
        self.on_target_error = policy;
        self
    }

    /// Sets whether zeroed regions may be unmapped on the target.
    #[must_use]
    pub const fn with_unmap(mut self, unmap: bool) -> Self {
        self.unmap = unmap;
        self
    }

    /// Names the node the target replaces on completion.
    #[must_use]
    pub fn with_replaces(mut self, node: impl Into<String>) -> Self {
        self.replaces = Some(node.into());
        self
    }

    /// Sets the cap on outstanding work units. Zero is bumped to one.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Sets the pacing quantum.
    #[must_use]
    pub const fn with_slice_time(mut self, slice_time: Duration) -> Self {
        self.slice_time = slice_time;
        self
    }

    /// Validates the parameters against `target` and fills in defaults.
    pub(crate) fn resolve(&self, target: &dyn BlockDevice) -> Result<Resolved, MirrorError> {
        if self.sync_mode == SyncMode::Incremental {
            return Err(MirrorError::UnsupportedSyncMode(self.sync_mode));
        }

        let granularity = if self.granularity == 0 {
            default_granularity(target)
        } else {
            self.granularity
        };
        if !(MIN_GRANULARITY..=MAX_GRANULARITY).contains(&granularity) {
            return Err(MirrorError::invalid(
                "granularity",
                format!("must be between {MIN_GRANULARITY} and {MAX_GRANULARITY}"),
            ));
        }
        if !granularity.is_power_of_two() {
            return Err(MirrorError::invalid("granularity", "must be a power of two"));
        }

        let buf_size = if self.buf_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buf_size
        };
        let buf_size = buf_size
            .checked_next_multiple_of(granularity)
            .ok_or_else(|| MirrorError::invalid("buf-size", "too large"))?;

        if self.max_in_flight == 0 {
            return Err(MirrorError::invalid("max-in-flight", "must be at least one"));
        }

        Ok(Resolved {
            granularity,
            buf_size,
            slice_time: if self.slice_time.is_zero() {
                DEFAULT_SLICE_TIME
            } else {
                self.slice_time
            },
        })
    }
}

/// Values computed from a [`MirrorConfig`] and the target at start.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Resolved {
    pub(crate) granularity: u64,
    pub(crate) buf_size: u64,
    pub(crate) slice_time: Duration,
}

/// Chunk size used when none is configured: the target's cluster size
/// clamped to 4 KiB..=64 KiB, or 64 KiB when the target has no clusters.
#[must_use]
pub fn default_granularity(target: &dyn BlockDevice) -> u64 {
    target.info().cluster_size.map_or(DEFAULT_GRANULARITY_CEIL, |cluster| {
        cluster
            .clamp(DEFAULT_GRANULARITY_FLOOR, DEFAULT_GRANULARITY_CEIL)
            .next_power_of_two()
    })
}

#[cfg(feature = "serde")]
mod human {
    use std::num::NonZeroU64;
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    pub(super) fn speed<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(bytes),
            Raw::Text(text) => bandwidth::parse_speed(&text)
                .map(|speed| speed.map_or(0, NonZeroU64::get))
                .map_err(D::Error::custom),
        }
    }

    pub(super) fn size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(bytes),
            Raw::Text(text) => bandwidth::parse_size(&text).map_err(D::Error::custom),
        }
    }

    pub(super) mod millis {
        use super::{Deserialize, Deserializer, Duration, Serialize, Serializer};

        pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
            u64::try_from(value.as_millis())
                .unwrap_or(u64::MAX)
                .serialize(serializer)
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
            u64::deserialize(deserializer).map(Duration::from_millis)
        }
    }
}
