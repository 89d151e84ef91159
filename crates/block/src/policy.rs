//! Error policy classification.

use std::fmt;
use std::str::FromStr;

use crate::error::BlockError;

/// What to do when an I/O operation fails.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum OnErrorPolicy {
    /// Fail the job with the error.
    #[default]
    Report,
    /// Leave the region dirty and retry it later.
    Ignore,
    /// Pause the job until it is resumed.
    Stop,
    /// Pause on out-of-space errors, report everything else.
    Enospc,
}

/// Verdict of an [`OnErrorPolicy`] for one failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorAction {
    /// The failure becomes the job's final status.
    Report,
    /// The failure is dropped and the work retried.
    Ignore,
    /// The job pauses.
    Stop,
}

impl OnErrorPolicy {
    /// Classifies `error` under this policy.
    #[must_use]
    pub const fn action(self, error: &BlockError) -> ErrorAction {
        match self {
            Self::Report => ErrorAction::Report,
            Self::Ignore => ErrorAction::Ignore,
            Self::Stop => ErrorAction::Stop,
            Self::Enospc if error.is_no_space() => ErrorAction::Stop,
            Self::Enospc => ErrorAction::Report,
        }
    }

    /// Returns `true` if the policy can pause a job, which requires the
    /// node to track I/O status.
    #[must_use]
    pub const fn may_stop(self) -> bool {
        matches!(self, Self::Stop | Self::Enospc)
    }

    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Ignore => "ignore",
            Self::Stop => "stop",
            Self::Enospc => "enospc",
        }
    }
}

impl fmt::Display for OnErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an error policy name is not recognised.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown error policy '{0}' (expected report, ignore, stop or enospc)")]
pub struct PolicyParseError(String);

impl FromStr for OnErrorPolicy {
    type Err = PolicyParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "ignore" => Ok(Self::Ignore),
            "stop" => Ok(Self::Stop),
            "enospc" => Ok(Self::Enospc),
            _ => Err(PolicyParseError(text.to_owned())),
        }
    }
}
