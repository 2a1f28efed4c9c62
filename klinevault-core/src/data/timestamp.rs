//! Store timestamp encoding.
//!
//! Stores are written as `YYYY-MM-DD HH:MM:SS+00:00`. Reading is lenient:
//! files produced by other tools use RFC 3339, naive UTC datetimes, or raw
//! epoch milliseconds, and all of them are accepted.

use chrono::{DateTime, NaiveDateTime, Utc};

const WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S+00:00";

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%.f%:z"];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(WRITE_FORMAT).to_string()
}

/// Parse any accepted timestamp form into a UTC instant.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expected() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 12, 20, 0, 0).unwrap()
    }

    #[test]
    fn writes_utc_offset_form() {
        assert_eq!(format_timestamp(expected()), "2025-12-12 20:00:00+00:00");
    }

    #[test]
    fn accepts_every_known_form() {
        for raw in [
            "2025-12-12 20:00:00+00:00",
            "2025-12-12T20:00:00Z",
            "2025-12-12T20:00:00+00:00",
            "2025-12-13 04:00:00+08:00",
            "2025-12-12 20:00:00",
            "2025-12-12T20:00:00",
            "2025-12-12 20:00:00.000",
            "1765569600000",
            " 2025-12-12 20:00:00+00:00 ",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected()), "failed on {raw:?}");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2025-13-45 99:00:00"), None);
    }

    #[test]
    fn format_then_parse_is_identity() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 0).unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(ts)), Some(ts));
    }
}
