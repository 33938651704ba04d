//! Configuration for the cell engine and demo runner.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::scheduler::Strategy;

/// What `submit` does with a request no registered robot can serve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnroutablePolicy {
    /// Accept it and leave it queued; it shows up in stall reports.
    #[default]
    Queue,
    /// Fail fast with `RoutingExhausted`.
    Reject,
}

impl FromStr for UnroutablePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(UnroutablePolicy::Queue),
            "reject" => Ok(UnroutablePolicy::Reject),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for UnroutablePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnroutablePolicy::Queue => write!(f, "queue"),
            UnroutablePolicy::Reject => write!(f, "reject"),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::UnknownLogFormat(other.to_string())),
        }
    }
}

/// Simulated durations used by the process simulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SimTiming {
    /// Robot travel time for each half of a transfer.
    pub move_ms: u64,
    /// Dwell at a process station.
    pub process_ms: u64,
    /// Dwell at a buffer station.
    pub buffer_ms: u64,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            move_ms: 5,
            process_ms: 10,
            buffer_ms: 2,
        }
    }
}

/// Cell configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellConfig {
    /// Scheduler concurrency strategy.
    pub strategy: Strategy,

    /// Handling of requests no robot can serve.
    pub unroutable: UnroutablePolicy,

    /// Queue dwell after which a request is reported as stalled. `None` disables.
    pub stall_after: Option<Duration>,

    /// Simulator timings.
    pub timing: SimTiming,

    pub log_format: LogFormat,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Lock,
            unroutable: UnroutablePolicy::Queue,
            stall_after: Some(Duration::from_secs(30)),
            timing: SimTiming::default(),
            log_format: LogFormat::Text,
        }
    }
}

impl CellConfig {
    /// Load configuration from `WAFER_CELL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let strategy = match lookup("WAFER_CELL_STRATEGY") {
            Some(value) => value.parse()?,
            None => defaults.strategy,
        };

        let unroutable = match lookup("WAFER_CELL_UNROUTABLE") {
            Some(value) => value.parse()?,
            None => defaults.unroutable,
        };

        // Zero disables stall reporting.
        let stall_after = match lookup("WAFER_CELL_STALL_MS") {
            Some(value) => match millis("WAFER_CELL_STALL_MS", &value)? {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            None => defaults.stall_after,
        };

        let timing = SimTiming {
            move_ms: optional_millis(&lookup, "WAFER_CELL_MOVE_MS")?
                .unwrap_or(defaults.timing.move_ms),
            process_ms: optional_millis(&lookup, "WAFER_CELL_PROCESS_MS")?
                .unwrap_or(defaults.timing.process_ms),
            buffer_ms: optional_millis(&lookup, "WAFER_CELL_BUFFER_MS")?
                .unwrap_or(defaults.timing.buffer_ms),
        };

        let log_format = match lookup("WAFER_CELL_LOG") {
            Some(value) => value.parse()?,
            None => defaults.log_format,
        };

        Ok(Self {
            strategy,
            unroutable,
            stall_after,
            timing,
            log_format,
        })
    }
}

fn millis(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn optional_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    lookup(key).map(|value| millis(key, &value)).transpose()
}
