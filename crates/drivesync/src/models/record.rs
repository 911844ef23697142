//! The minimal record interface the merge works over

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// A mergeable entity: identity plus a last-modified timestamp
pub trait Versioned {
    /// Identity of the record; unique within a table
    fn id(&self) -> &str;

    /// Last modification time, if the record carries a valid one
    fn updated_at(&self) -> Option<DateTime<Utc>>;
}

/// Offset-less date-time layouts, read as UTC
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO-8601 timestamp
///
/// Accepts RFC 3339, date-times without an offset and plain dates. Values
/// without an offset are taken as UTC; a plain date is its UTC midnight.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Raw JSON records as stored in local collections and remote snapshots
///
/// A record without a string `id` has an empty identity; a missing or
/// unparseable `updatedAt` yields `None`.
impl Versioned for Value {
    fn id(&self) -> &str {
        self.get("id").and_then(Value::as_str).unwrap_or("")
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.get("updatedAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }
}
