//! Timestamp precision handling.
//!
//! The database stores nanoseconds, which is more than a millisecond clock
//! can carry. [`NanoDate`] keeps the millisecond instant together with the
//! full-precision decimal string whenever one is known.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

const NANOS_PER_MILLI: i128 = 1_000_000;
const NANOS_PER_SECOND: i128 = 1_000_000_000;

// ------------------------------------------------------------------ //
//  Precision                                                          //
// ------------------------------------------------------------------ //

/// Unit a timestamp is expressed in (`h`, `m`, `s`, `ms`, `u`, `n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "ms")]
    Milliseconds,
    #[serde(rename = "u")]
    Microseconds,
    #[default]
    #[serde(rename = "n")]
    Nanoseconds,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Hours        => "h",
            Precision::Minutes      => "m",
            Precision::Seconds      => "s",
            Precision::Milliseconds => "ms",
            Precision::Microseconds => "u",
            Precision::Nanoseconds  => "n",
        }
    }

    /// Nanoseconds in one unit of this precision.
    pub fn nanos_per_unit(self) -> i128 {
        match self {
            Precision::Hours        => 3_600 * NANOS_PER_SECOND,
            Precision::Minutes      => 60 * NANOS_PER_SECOND,
            Precision::Seconds      => NANOS_PER_SECOND,
            Precision::Milliseconds => NANOS_PER_MILLI,
            Precision::Microseconds => 1_000,
            Precision::Nanoseconds  => 1,
        }
    }

    /// True for `ms`, `s`, `m` and `h`, which a millisecond clock can hold
    /// without loss.
    pub fn is_millis_or_coarser(self) -> bool {
        self.nanos_per_unit() >= NANOS_PER_MILLI
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "h"        => Ok(Precision::Hours),
            "m"        => Ok(Precision::Minutes),
            "s"        => Ok(Precision::Seconds),
            "ms"       => Ok(Precision::Milliseconds),
            "u" | "us" => Ok(Precision::Microseconds),
            "n" | "ns" => Ok(Precision::Nanoseconds),
            other      => Err(Error::Validation(format!("unknown precision '{other}'"))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------------ //
//  NanoDate                                                           //
// ------------------------------------------------------------------ //

/// A millisecond instant plus an optional full-precision nanosecond epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NanoDate {
    millis: i64,
    nano_time: Option<String>,
}

impl NanoDate {
    /// An instant with millisecond precision only.
    pub fn from_millis(millis: i64) -> Self {
        Self {
            millis,
            nano_time: None,
        }
    }

    /// An instant with full nanosecond precision. Fails when the instant
    /// does not fit an `i64` millisecond clock.
    pub fn from_nanos(nanos: i128) -> Result<Self> {
        Ok(Self {
            millis: millis_of(nanos)?,
            nano_time: Some(nanos.to_string()),
        })
    }

    /// Parses a decimal nanosecond epoch such as `"1475985480231035600"`.
    pub fn from_nano_str(s: &str) -> Result<Self> {
        if !is_integer(s) {
            return Err(Error::Validation(format!(
                "expected a nanosecond timestamp, but got '{s}'"
            )));
        }
        let nanos: i128 = s
            .parse()
            .map_err(|_| Error::Validation(format!("timestamp '{s}' is out of range")))?;
        Self::from_nanos(nanos)
    }

    /// Builds an instant from an integer epoch at `precision`. Precisions of a
    /// millisecond or coarser carry no full-precision companion.
    pub fn from_epoch(value: i64, precision: Precision) -> Result<Self> {
        let nanos = value as i128 * precision.nanos_per_unit();
        if precision.is_millis_or_coarser() {
            Ok(Self::from_millis(millis_of(nanos)?))
        } else {
            Self::from_nanos(nanos)
        }
    }

    /// Parses an RFC 3339 timestamp, keeping up to nine fractional digits.
    pub fn parse_iso(s: &str) -> Result<Self> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|e| Error::Validation(format!("invalid timestamp '{s}': {e}")))?;
        Ok(Self::from(dt.with_timezone(&Utc)))
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    /// Whether the nanosecond digits are known rather than derived from
    /// the millisecond instant.
    pub fn has_nano_precision(&self) -> bool {
        self.nano_time.is_some()
    }

    /// Nanoseconds since the epoch.
    pub fn nanos(&self) -> i128 {
        self.nano_time
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.millis as i128 * NANOS_PER_MILLI)
    }

    /// Decimal nanosecond epoch.
    pub fn nano_time(&self) -> String {
        match &self.nano_time {
            Some(s) => s.clone(),
            None => (self.millis as i128 * NANOS_PER_MILLI).to_string(),
        }
    }

    /// Epoch at `precision`, truncated (not rounded).
    pub fn time_at(&self, precision: Precision) -> String {
        (self.nanos() / precision.nanos_per_unit()).to_string()
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let nanos = self.nanos();
        let secs = i64::try_from(nanos.div_euclid(NANOS_PER_SECOND)).ok()?;
        let sub = nanos.rem_euclid(NANOS_PER_SECOND) as u32;
        Utc.timestamp_opt(secs, sub).single()
    }

    /// RFC 3339 with nine fractional digits, e.g.
    /// `2016-10-09T03:58:00.231035600Z`.
    pub fn to_iso_string(&self) -> String {
        match self.to_datetime() {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Nanos, true),
            None => self.nano_time(),
        }
    }
}

impl From<DateTime<Utc>> for NanoDate {
    fn from(dt: DateTime<Utc>) -> Self {
        let nanos = dt.timestamp() as i128 * NANOS_PER_SECOND + dt.timestamp_subsec_nanos() as i128;
        Self {
            millis: dt.timestamp_millis(),
            nano_time: Some(nanos.to_string()),
        }
    }
}

impl From<SystemTime> for NanoDate {
    fn from(t: SystemTime) -> Self {
        Self::from(DateTime::<Utc>::from(t))
    }
}

impl fmt::Display for NanoDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso_string())
    }
}

impl Serialize for NanoDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso_string())
    }
}

// ------------------------------------------------------------------ //
//  Write timestamps                                                   //
// ------------------------------------------------------------------ //

/// A point timestamp as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Timestamp {
    /// A decimal epoch already expressed in the write precision.
    Raw(String),
    /// An integer epoch already expressed in the write precision.
    Integer(i64),
    /// An instant, converted to the write precision on encode.
    Date(NanoDate),
}

impl From<&str> for Timestamp {
    fn from(s: &str) -> Self {
        Timestamp::Raw(s.to_string())
    }
}

impl From<String> for Timestamp {
    fn from(s: String) -> Self {
        Timestamp::Raw(s)
    }
}

impl From<i64> for Timestamp {
    fn from(v: i64) -> Self {
        Timestamp::Integer(v)
    }
}

impl From<NanoDate> for Timestamp {
    fn from(d: NanoDate) -> Self {
        Timestamp::Date(d)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::Date(dt.into())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        Timestamp::Date(t.into())
    }
}

/// Renders a timestamp as the integer the write endpoint expects at
/// `precision`. Raw strings must already be integers and pass verbatim.
pub fn cast_timestamp(ts: &Timestamp, precision: Precision) -> Result<String> {
    match ts {
        Timestamp::Raw(s) if is_integer(s) => Ok(s.clone()),
        Timestamp::Raw(s) => Err(Error::Validation(format!(
            "expected numeric value for timestamp, but got '{s}'"
        ))),
        Timestamp::Integer(v) => Ok(v.to_string()),
        Timestamp::Date(d) => Ok(d.time_at(precision)),
    }
}

fn millis_of(nanos: i128) -> Result<i64> {
    i64::try_from(nanos.div_euclid(NANOS_PER_MILLI))
        .map_err(|_| Error::Validation(format!("timestamp {nanos}ns is out of range")))
}

fn is_integer(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
