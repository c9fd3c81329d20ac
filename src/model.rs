use std::fmt;

use chrono::{Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid coordinate: lat={0}, lon={1}")]
    InvalidCoordinate(f64, f64),

    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),

    #[error("value too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Validated geographic coordinates
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    lat: f64,
    lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Result<Self, ValidationError> {
        if !lat.is_finite()
            || !lon.is_finite()
            || !(-90.0..=90.0).contains(&lat)
            || !(-180.0..=180.0).contains(&lon)
        {
            return Err(ValidationError::InvalidCoordinate(lat, lon));
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }
}

/// Drain ordering hint. Declaration order is drain order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a wall-clock `HH:MM` value.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ValidationError::InvalidTimeOfDay(value.to_string()))
}

pub fn format_time_of_day(time: NaiveTime) -> String {
    format!("{:02}:{:02}", time.hour(), time.minute())
}

/// Time source. Injected so quiet hours and timestamps are testable.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> UnixTimeMs;

    /// Local wall-clock time, used for quiet hours.
    fn local_time(&self) -> NaiveTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }

    fn local_time(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Clock pinned to a fixed instant and time of day.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    pub now: UnixTimeMs,
    pub local: NaiveTime,
}

impl FixedClock {
    pub fn at(hour: u32, minute: u32) -> Self {
        Self {
            now: UnixTimeMs(1_700_000_000_000),
            local: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> UnixTimeMs {
        self.now
    }

    fn local_time(&self) -> NaiveTime {
        self.local
    }
}
