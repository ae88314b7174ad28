//! UTC timestamps with a stable ISO-8601 wire form.

use crate::error::{TypeError, TypeResult};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::fmt;

/// Milliseconds-since-epoch, clamped to chrono's representable range.
fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// A UTC timestamp truncated to millisecond precision.
///
/// Delta tokens and `__updatedAt` comparisons go through this type so that
/// `format ∘ parse` is the identity for every timestamp the engine produces.
/// The wire form is ISO-8601 / RFC 3339 with exactly three fractional digits
/// and a `Z` suffix, independent of locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// The Unix epoch. Used as the default delta token.
    #[must_use]
    pub fn epoch() -> Self {
        Self(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// The current time, truncated to milliseconds.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Creates a timestamp from a chrono datetime, truncating to milliseconds.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(datetime_from_millis(dt.timestamp_millis()))
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub fn from_unix_millis(millis: i64) -> Self {
        Self(datetime_from_millis(millis))
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn unix_millis(self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Parses an ISO-8601 timestamp, accepting any RFC 3339 offset and
    /// normalizing to UTC milliseconds.
    pub fn parse(value: &str) -> TypeResult<Self> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
            .map_err(|e| TypeError::invalid_timestamp(value, e.to_string()))
    }

    /// Renders the canonical wire form, e.g. `2024-05-01T12:30:00.000Z`.
    #[must_use]
    pub fn to_iso8601(self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::epoch()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_iso8601())
    }
}
