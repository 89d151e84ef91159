//! crates/logging/src/config.rs
//! Subscriber configuration and the verbosity to directive mapping.

/// Target every mirror engine event is emitted under.
pub const MIRROR_TARGET: &str = "blkmirror::mirror";

/// Filter directives for a `-v` style verbosity level.
///
/// Level 0 keeps warnings and errors, level 1 adds informational events,
/// level 2 adds the engine's debug events (pass restarts, buffer
/// starvation) and level 3 and above enable per-unit trace events.
#[must_use]
pub const fn verbosity_directives(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "info,blkmirror=debug",
        _ => "info,blkmirror=trace",
    }
}

/// How the global subscriber is set up.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct LogConfig {
    /// `EnvFilter` directives such as `"warn,blkmirror=trace"`. When unset
    /// the `RUST_LOG` environment variable is used, and failing that the
    /// verbosity level.
    pub directives: Option<String>,
    /// Verbosity level consulted when no directives are available.
    pub verbosity: u8,
    /// Colour the output.
    pub ansi: bool,
    /// Print each event's target.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directives: None,
            verbosity: 0,
            ansi: true,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Configuration for a verbosity level, ignoring `RUST_LOG`.
    #[must_use]
    pub fn from_verbose_level(level: u8) -> Self {
        Self {
            directives: Some(verbosity_directives(level).to_owned()),
            verbosity: level,
            ..Self::default()
        }
    }

    /// Sets explicit filter directives.
    #[must_use]
    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    /// Enables or disables coloured output.
    #[must_use]
    pub const fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Enables or disables printing of event targets.
    #[must_use]
    pub const fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    /// Directives to build the filter from, given the value of `RUST_LOG`.
    pub(crate) fn effective_directives(&self, env: Option<&str>) -> String {
        if let Some(directives) = self.directives.as_deref() {
            return directives.to_owned();
        }
        match env.map(str::trim) {
            Some(env) if !env.is_empty() => env.to_owned(),
            _ => verbosity_directives(self.verbosity).to_owned(),
        }
    }
}
