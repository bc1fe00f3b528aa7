//! Timestamp codec
//!
//! Every timestamp in the repository is UTC, RFC 3339, with exactly six
//! fractional digits and a literal `Z`: `2020-10-07T22:44:06.243914Z`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::{Error, Result};

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const ENCODED_LEN: usize = "2020-10-07T22:44:06.243914Z".len();

/// Current time truncated to microsecond precision
pub fn now() -> DateTime<Utc> {
    truncate_micros(Utc::now())
}

/// Drop sub-microsecond precision so values survive a format/parse cycle
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000).unwrap_or(ts)
}

/// Format a timestamp in the repository shape
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.format(FORMAT).to_string()
}

/// Parse a timestamp, accepting only the repository shape
pub fn parse(s: &str) -> Result<DateTime<Utc>> {
    if s.len() != ENCODED_LEN || !s.ends_with('Z') {
        return Err(Error::Serialization(format!(
            "timestamp {:?} is not RFC 3339 with microseconds and Z suffix",
            s
        )));
    }
    let naive = NaiveDateTime::parse_from_str(s, FORMAT)
        .map_err(|e| Error::Serialization(format!("invalid timestamp {:?}: {}", s, e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// serde adapter for `DateTime<Utc>` fields
pub mod rfc3339_micros {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_shape() {
        let ts = Utc.with_ymd_and_hms(2020, 10, 7, 22, 44, 6).unwrap();
        assert_eq!(format(&ts), "2020-10-07T22:44:06.000000Z");
    }

    #[test]
    fn test_parse_round_trip() {
        let ts = parse("2020-10-07T22:44:06.243914Z").unwrap();
        assert_eq!(ts.nanosecond(), 243_914_000);
        assert_eq!(format(&ts), "2020-10-07T22:44:06.243914Z");

        let now = now();
        assert_eq!(parse(&format(&now)).unwrap(), now);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(parse("2020-10-07T22:44:06Z").is_err());
        assert!(parse("2020-10-07T22:44:06.243Z").is_err());
        assert!(parse("2020-10-07T22:44:06.243914+00:00").is_err());
        assert!(parse("2020-10-07T22:44:06.243914").is_err());
        assert!(parse("2020-10-07 22:44:06.243914Z").is_err());
    }
}
