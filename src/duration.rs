use serde::{Deserialize, Serialize};
use std::fmt;

/// A duration that serializes to `{"value": N, "unit": "h"}` in policy JSON,
/// always picking the largest unit that does not lose accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration {
    seconds: u64,
}

#[derive(Serialize, Deserialize)]
struct DurationObj {
    value: u64,
    unit: String,
}

// ordered from big to small
const UNITS: &[(&str, u64)] = &[
    ("y", 365 * 24 * 3600),
    ("w", 7 * 24 * 3600),
    ("d", 24 * 3600),
    ("h", 3600),
    ("m", 60),
    ("s", 1),
];

impl Duration {
    pub fn from_secs(seconds: u64) -> Self {
        Duration { seconds }
    }

    pub fn as_secs(&self) -> u64 {
        self.seconds
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // without this special case, zero would render as "0 years"
        if self.seconds == 0 {
            return DurationObj { value: 0, unit: "s".into() }.serialize(serializer);
        }

        for (unit, length) in UNITS {
            if self.seconds % length == 0 {
                return DurationObj {
                    value: self.seconds / length,
                    unit: (*unit).into(),
                }
                .serialize(serializer);
            }
        }
        unreachable!("the final unit length is 1")
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let obj = DurationObj::deserialize(deserializer)?;
        for (unit, length) in UNITS {
            if *unit == obj.unit {
                return Ok(Duration { seconds: obj.value * length });
            }
        }
        Err(serde::de::Error::custom(format!("unknown duration unit: {:?}", obj.unit)))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, length) in UNITS {
            if self.seconds >= *length && self.seconds % length == 0 {
                return write!(f, "{}{}", self.seconds / length, unit);
            }
        }
        write!(f, "{}s", self.seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_largest_lossless_unit() {
        let cases = [
            (0, r#"{"value":0,"unit":"s"}"#),
            (1, r#"{"value":1,"unit":"s"}"#),
            (60, r#"{"value":1,"unit":"m"}"#),
            (90, r#"{"value":90,"unit":"s"}"#),
            (3600, r#"{"value":1,"unit":"h"}"#),
            (2 * 24 * 3600, r#"{"value":2,"unit":"d"}"#),
            (14 * 24 * 3600, r#"{"value":2,"unit":"w"}"#),
            (365 * 24 * 3600, r#"{"value":1,"unit":"y"}"#),
        ];
        for (seconds, expected) in cases {
            let rendered = serde_json::to_string(&Duration::from_secs(seconds)).unwrap();
            assert_eq!(rendered, expected, "for {seconds} seconds");
        }
    }

    #[test]
    fn test_round_trip() {
        for seconds in [0, 1, 59, 60, 3600, 86400, 604800, 31536000, 12345] {
            let duration = Duration::from_secs(seconds);
            let json = serde_json::to_string(&duration).unwrap();
            let back: Duration = serde_json::from_str(&json).unwrap();
            assert_eq!(duration, back);
        }
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let result: Result<Duration, _> = serde_json::from_str(r#"{"value":1,"unit":"fortnight"}"#);
        assert!(result.is_err());
    }
}
