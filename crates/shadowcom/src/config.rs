//! Tracker configuration
//!
//! Settings are plain values; an [`ObjectTracker`](crate::ObjectTracker) freezes them at
//! its first tracking call. [`TrackerConfig::from_env`] reads overrides from:
//!
//! | Variable                     | Values                    |
//! |------------------------------|---------------------------|
//! | `SHADOWCOM_OBJECT_TRACKING`  | `1`/`0`, `true`/`false`   |
//! | `SHADOWCOM_TRACKING_MODE`    | `global`, `per-thread`    |
//! | `SHADOWCOM_CAPTURE_BACKTRACE`| `1`/`0`, `true`/`false`   |
//! | `SHADOWCOM_RELEASE_ON_DROP`  | `1`/`0`, `true`/`false`   |

use tracing::warn;

pub const ENV_OBJECT_TRACKING: &str = "SHADOWCOM_OBJECT_TRACKING";
pub const ENV_TRACKING_MODE: &str = "SHADOWCOM_TRACKING_MODE";
pub const ENV_CAPTURE_BACKTRACE: &str = "SHADOWCOM_CAPTURE_BACKTRACE";
pub const ENV_RELEASE_ON_DROP: &str = "SHADOWCOM_RELEASE_ON_DROP";

/// Where tracked references live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingMode {
    /// One table shared by all threads
    #[default]
    Global,
    /// One table per thread; a thread only sees what it tracked itself
    PerThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Record native handles of live wrappers
    pub enabled: bool,
    pub mode: TrackingMode,
    /// Capture a backtrace for every tracked reference
    pub capture_backtraces: bool,
    /// Release the native object when a still-bound wrapper is dropped
    pub release_on_drop: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: TrackingMode::Global,
            capture_backtraces: false,
            release_on_drop: true,
        }
    }
}

impl TrackerConfig {
    /// Tracking switched on, everything else default.
    pub fn tracking() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: TrackingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_backtraces(mut self, capture: bool) -> Self {
        self.capture_backtraces = capture;
        self
    }

    pub fn with_release_on_drop(mut self, release: bool) -> Self {
        self.release_on_drop = release;
        self
    }

    /// Defaults overridden by the `SHADOWCOM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_OBJECT_TRACKING) {
            parse_flag(ENV_OBJECT_TRACKING, &value, &mut config.enabled);
        }
        if let Some(value) = lookup(ENV_TRACKING_MODE) {
            match value.trim().to_ascii_lowercase().as_str() {
                "global" => config.mode = TrackingMode::Global,
                "per-thread" | "per_thread" | "thread" => config.mode = TrackingMode::PerThread,
                other => warn!(variable = ENV_TRACKING_MODE, value = other, "ignoring unknown tracking mode"),
            }
        }
        if let Some(value) = lookup(ENV_CAPTURE_BACKTRACE) {
            parse_flag(ENV_CAPTURE_BACKTRACE, &value, &mut config.capture_backtraces);
        }
        if let Some(value) = lookup(ENV_RELEASE_ON_DROP) {
            parse_flag(ENV_RELEASE_ON_DROP, &value, &mut config.release_on_drop);
        }
        config
    }
}

fn parse_flag(variable: &str, value: &str, slot: &mut bool) {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        other => warn!(variable, value = other, "ignoring invalid boolean"),
    }
}
