//! Gateway configuration primitives: log sizes and rotation cadences.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use thiserror::Error;

/// Errors produced while parsing configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The size string was not `<n>`, `<n>KB`, `<n>MB` or `<n>GB`.
    #[error("invalid size `{0}`, expected <n>[KB|MB|GB]")]
    InvalidSize(String),

    /// The rotation string was not `<n>d`, `<n>h` or `<n>w`.
    #[error("invalid rotation interval `{0}`, expected <n>d, <n>h or <n>w")]
    InvalidRotation(String),
}

/// Parse a human size such as `50MB` into bytes.
///
/// A bare number is taken as bytes. Suffixes are case insensitive.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(head) = trimmed.strip_suffix("KB") {
        (head.to_string(), 1024)
    } else if let Some(head) = trimmed.strip_suffix("MB") {
        (head.to_string(), 1024 * 1024)
    } else if let Some(head) = trimmed.strip_suffix("GB") {
        (head.to_string(), 1024 * 1024 * 1024)
    } else {
        (trimmed.clone(), 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| ConfigError::InvalidSize(input.to_string()))
}

/// Time-based rotation cadence for the request log.
///
/// Daily rotation happens at midnight, hourly at the top of the hour and
/// weekly on Monday at midnight; the numeric part stretches the interval
/// (`2d` rotates every second midnight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationSpec {
    Daily(u32),
    Hourly(u32),
    Weekly(u32),
}

impl FromStr for RotationSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || ConfigError::InvalidRotation(s.to_string());
        let (digits, unit) = trimmed.split_at(trimmed.len().saturating_sub(1));
        let count: u32 = digits.parse().map_err(|_| err())?;
        if count == 0 {
            return Err(err());
        }
        match unit {
            "d" | "D" => Ok(RotationSpec::Daily(count)),
            "h" | "H" => Ok(RotationSpec::Hourly(count)),
            "w" | "W" => Ok(RotationSpec::Weekly(count)),
            _ => Err(err()),
        }
    }
}

impl RotationSpec {
    /// First rotation boundary strictly after `now`.
    pub fn next_boundary(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            RotationSpec::Daily(n) => {
                let midnight = next_midnight(now);
                midnight + Duration::days(i64::from(n) - 1)
            }
            RotationSpec::Hourly(n) => {
                let top = now
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .expect("truncating to the hour is valid")
                    + Duration::hours(1);
                top + Duration::hours(i64::from(n) - 1)
            }
            RotationSpec::Weekly(n) => {
                let midnight = next_midnight(now);
                let days_to_monday = (7 - midnight.weekday().num_days_from_monday()) % 7;
                midnight + Duration::days(i64::from(days_to_monday)) + Duration::weeks(i64::from(n) - 1)
            }
        }
    }

    /// Length of one rotation interval.
    pub fn interval(&self) -> Duration {
        match *self {
            RotationSpec::Daily(n) => Duration::days(i64::from(n)),
            RotationSpec::Hourly(n) => Duration::hours(i64::from(n)),
            RotationSpec::Weekly(n) => Duration::weeks(i64::from(n)),
        }
    }

    /// strftime pattern used for archive suffixes of this cadence.
    pub fn archive_suffix_format(&self) -> &'static str {
        match self {
            RotationSpec::Hourly(_) => "%Y-%m-%d_%H",
            _ => "%Y-%m-%d",
        }
    }
}

fn next_midnight(now: NaiveDateTime) -> NaiveDateTime {
    (now.date() + Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
}

/// Request-log settings assembled at startup and shared by the writer and
/// the reader.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Directory holding `requests.log` and its archives.
    pub dir: PathBuf,
    /// Size threshold that triggers rotation when no cadence is set.
    pub max_bytes: u64,
    /// Number of archived files to retain.
    pub backup_count: usize,
    /// Optional time-based rotation cadence; overrides size rotation.
    pub rotation: Option<RotationSpec>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            max_bytes: 50 * 1024 * 1024,
            backup_count: 10,
            rotation: None,
        }
    }
}
