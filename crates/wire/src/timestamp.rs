use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use errors::ErrorMetadata;
use serde::{Deserialize, Serialize};

/// A field or object timestamp.
///
/// Per spec.md §4.1, timestamps must be total-ordered as lexicographic
/// strings; implementations must not compare across time zones. This type
/// enforces that by normalizing every timestamp to UTC with a fixed-width
/// nanosecond fraction on construction, so `Ord` on the wrapped string
/// agrees with chronological order for every value this type can hold.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    /// Parse and re-normalize an externally supplied ISO 8601 string so its
    /// string representation is guaranteed comparable with every other
    /// `Timestamp` in the system.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|e| {
                anyhow::Error::new(e).context(ErrorMetadata::validation(
                    "InvalidTimestamp",
                    format!("{s:?} is not a valid ISO 8601 timestamp."),
                ))
            })?
            .with_timezone(&Utc);
        Ok(Self::from_datetime(dt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn lexicographic_order_matches_chronological_order() {
        let t1 = Timestamp::from_datetime(Utc::now());
        std::thread::sleep(Duration::from_millis(2));
        let t2 = Timestamp::from_datetime(Utc::now());
        assert!(t1 < t2);
        assert!(t1.as_str() < t2.as_str());
    }

    #[test]
    fn parse_normalizes_offset_timestamps_to_utc() {
        let t = Timestamp::parse("2024-01-01T00:00:00+02:00").unwrap();
        assert!(t.as_str().ends_with('Z'));
        assert!(t.as_str().starts_with("2023-12-31T22:00:00"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Timestamp::parse("not-a-timestamp").is_err());
    }
}
