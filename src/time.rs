// Time utility functions

use crate::error::ApiError;
use crate::Error;
use crate::Result;
use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Deref, Sub};
use std::time::Duration;

enum Time {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl Time {
    fn to_milliseconds(&self) -> u64 {
        match self {
            Time::Millisecond => 1,
            Time::Second => 1000,
            Time::Minute => 60 * 1000,
            Time::Hour => 3600 * 1000,
            Time::Day => 86400 * 1000,
        }
    }
}

impl TryFrom<&str> for Time {
    type Error = Error;

    fn try_from(unit: &str) -> std::result::Result<Self, Self::Error> {
        match unit {
            "ms" => Ok(Time::Millisecond),
            "s" => Ok(Time::Second),
            "m" => Ok(Time::Minute),
            "h" => Ok(Time::Hour),
            "d" => Ok(Time::Day),
            _ => Err(crate::error::gen(format!(
                "Unknown time format: {unit} - valid types are ms, s, m, h, d"
            ))),
        }
    }
}

pub fn now_epoch_millis() -> Milliseconds {
    let now_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    Milliseconds(now_epoch)
}

/// Source of wall-clock time in epoch milliseconds. Cache expiry and metric
/// retention read the time through this trait so tests can drive it.
pub trait Clock: Send + Sync {
    fn now(&self) -> Milliseconds;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Milliseconds {
        now_epoch_millis()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Milliseconds(u64);

impl Milliseconds {
    pub fn new(milliseconds: u64) -> Self {
        Milliseconds(milliseconds)
    }

    pub fn saturating_sub(self, rhs: Milliseconds) -> Milliseconds {
        Milliseconds(self.0.saturating_sub(rhs.0))
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Local date time for an epoch timestamp expressed in milliseconds.
    pub fn to_local_datetime(&self) -> Option<DateTime<Local>> {
        Local.timestamp_millis_opt(self.0 as i64).single()
    }
}

impl Sub<Milliseconds> for Milliseconds {
    type Output = Milliseconds;

    fn sub(self, rhs: Milliseconds) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl Add<Milliseconds> for Milliseconds {
    type Output = Milliseconds;

    fn add(self, rhs: Milliseconds) -> Self::Output {
        Milliseconds(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Milliseconds> for Milliseconds {
    fn add_assign(&mut self, rhs: Milliseconds) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Deref for Milliseconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for Milliseconds {
    fn from(milliseconds: u64) -> Self {
        Milliseconds(milliseconds)
    }
}

impl From<Duration> for Milliseconds {
    fn from(duration: Duration) -> Self {
        Milliseconds(duration.as_millis() as u64)
    }
}

impl Display for Milliseconds {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert a string with time format to milliseconds.
/// A string with time format can be anything like:
/// 500ms, 2s, 2 seconds, 2 second, 2seconds, 5m, 5 minutes, 1h
/// A bare number is taken as milliseconds. Processing stops at the first
/// alphabetic run after the digits.
fn string_to_milliseconds(str_fmt: &str) -> Result<Milliseconds> {
    let str_fmt = str_fmt.trim();
    let digits_end = str_fmt
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(str_fmt.len());
    if digits_end == 0 {
        return Err(crate::error::gen(format!(
            "No digits found in time format: {str_fmt}"
        )));
    }
    let amount = str_fmt[..digits_end]
        .parse::<u64>()
        .map_err(|err| crate::error::gen(err.to_string()))?;
    let unit: String = str_fmt[digits_end..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let multiplier = match unit.as_str() {
        "" => Time::Millisecond.to_milliseconds(),
        "ms" | "millis" | "milliseconds" | "millisecond" => Time::Millisecond.to_milliseconds(),
        other => Time::try_from(&other[..1])?.to_milliseconds(),
    };
    Ok(Milliseconds(amount.saturating_mul(multiplier)))
}

impl TryFrom<&str> for Milliseconds {
    type Error = ApiError;

    fn try_from(str_fmt: &str) -> std::result::Result<Self, Self::Error> {
        match string_to_milliseconds(str_fmt) {
            Ok(milliseconds) => Ok(milliseconds),
            Err(err) => Err(ApiError::TimeConversionError(format!(
                "Could not convert {str_fmt} to time format: {err}"
            ))),
        }
    }
}
