//! Wall-clock and duration helpers

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
///
/// Cache timestamps are written into snapshots, so they are wall-clock based.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serde adapter storing a `Duration` as whole seconds
pub mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Holder {
        #[serde(with = "duration_secs")]
        ttl: Duration,
    }

    #[test]
    fn test_duration_as_seconds() {
        let json = serde_json::to_string(&Holder {
            ttl: Duration::from_secs(900),
        })
        .unwrap();
        assert_eq!(json, r#"{"ttl":900}"#);

        let back: Holder = serde_json::from_str(r#"{"ttl":60}"#).unwrap();
        assert_eq!(back.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_unix_millis_moves_forward() {
        let first = unix_millis();
        std::thread::sleep(Duration::from_millis(5));
        assert!(unix_millis() >= first + 5);
    }
}
