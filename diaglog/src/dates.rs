/// Types and utilities for manipulating timestamps.
///
/// All timestamps in decoded diagnostic data are UTC.  The textual stats
/// format and the summary output both use the ISO form without subsecond
/// precision.
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

pub type Timestamp = DateTime<Utc>;

/// "A long long time ago", used as the default for samples that carry no
/// usable time field.
pub fn epoch() -> Timestamp {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// The time right now.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Parse an RFC-3339 string into a Timestamp.
pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Render a Timestamp the way the summary output wants it.
pub fn format_timestamp(t: Timestamp) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[test]
fn test_parse_timestamp() {
    let t = parse_timestamp("2017-10-12T20:08:53Z").unwrap();
    assert!(format_timestamp(t) == "2017-10-12T20:08:53Z");
    assert!(parse_timestamp("2017-10-12T20:08:53+02:00").is_ok());
    assert!(parse_timestamp("yesterday").is_err());
    assert!(epoch() < t && t < now());
}
