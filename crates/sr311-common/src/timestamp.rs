//! Timestamp helpers
//!
//! The source API stores "floating" timestamps: ISO-8601 without a zone
//! designator and with millisecond precision. Everything inside the pipeline
//! works in UTC; these helpers convert at the edges.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::error::{CommonError, Result};

/// Format used for timestamp literals in source API filter expressions
pub const FLOATING_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Zone-less ISO-8601 layout, fractional seconds optional
const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Render a UTC instant as a source API floating timestamp
pub fn format_floating(ts: DateTime<Utc>) -> String {
    ts.format(FLOATING_FORMAT).to_string()
}

/// Render a UTC instant as RFC 3339, keeping full sub-second precision
pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an ISO-8601 timestamp.
///
/// Accepts RFC 3339 (any offset, normalised to UTC) as well as zone-less
/// timestamps such as `2024-01-31T23:59:59.123`, which are taken as UTC.
pub fn parse_iso8601(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(trimmed, NAIVE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| CommonError::invalid_timestamp(value, e.to_string()))
}

/// Midnight UTC at the start of `date`
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Serde adapter: writes RFC 3339, reads anything [`parse_iso8601`] accepts.
///
/// ```
/// use chrono::{DateTime, Utc};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct State {
///     #[serde(with = "sr311_common::timestamp::lenient")]
///     at: DateTime<Utc>,
/// }
/// ```
pub mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_rfc3339(*ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_iso8601(&raw).map_err(de::Error::custom)
    }
}
