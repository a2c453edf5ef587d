use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

/// Severity of a log event, in ascending priority. The numeric value of a
/// level is its priority: `Trace` is 0 and `Emergency` is 8. A level with a
/// higher priority is "more severe".
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// All levels, in ascending priority order. The position of a level in this
/// array equals its numeric priority.
pub const ALL_LEVELS: [Level; 9] = [
    Level::Trace,
    Level::Debug,
    Level::Info,
    Level::Notice,
    Level::Warning,
    Level::Error,
    Level::Critical,
    Level::Alert,
    Level::Emergency,
];

impl Level {
    /// The numeric priority of this level, 0 through 8.
    pub fn priority(self) -> u8 {
        self as u8
    }

    /// Whether an event at severity `event_level` passes a gate set to
    /// `self`. An event passes iff it is at least as severe as the gate.
    pub fn admits(self, event_level: Level) -> bool {
        event_level >= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Alert => "alert",
            Level::Emergency => "emergency",
        }
    }

    /// The level with the given numeric priority, if it is in range.
    pub fn from_priority(priority: u8) -> Option<Level> {
        ALL_LEVELS.get(priority as usize).copied()
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid log level")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_LEVELS
            .iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| ParseLevelError(s.to_owned()))
    }
}
