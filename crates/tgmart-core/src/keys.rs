//! Deterministic surrogate keys.
//!
//! Keys are the first 128 bits of a SHA-256 digest over the natural key parts,
//! joined with `-`, with empty strings standing in for missing parts.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Width of every surrogate key in hex characters.
pub const SURROGATE_KEY_LEN: usize = 32;

pub fn surrogate_key(parts: &[Option<&str>]) -> String {
    let joined = parts
        .iter()
        .map(|part| part.unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(SURROGATE_KEY_LEN);
    hex
}

pub fn channel_key(channel_username: &str) -> String {
    surrogate_key(&[Some(channel_username)])
}

/// Key of one detection event. Structurally identical events share a key.
pub fn detection_key(
    message_id: Option<i64>,
    object_class: Option<&str>,
    confidence: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
) -> String {
    let message_id = message_id.map(|id| id.to_string());
    let confidence = confidence.map(|c| c.to_string());
    let timestamp = timestamp.map(canonical_timestamp);
    surrogate_key(&[
        message_id.as_deref(),
        object_class,
        confidence.as_deref(),
        timestamp.as_deref(),
    ])
}

/// Fixed textual form of a timestamp used inside key material.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn channel_key_is_stable() {
        assert_eq!(channel_key("chan1"), "797e5887b3e390bc65acb5a81c47d1fe");
        assert_eq!(channel_key("chan1"), channel_key("chan1"));
        assert_ne!(channel_key("chan1"), channel_key("chan2"));
    }

    #[test]
    fn detection_key_covers_all_parts() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).single().unwrap();
        let key = detection_key(Some(100), Some("bottle"), Some(0.85), Some(ts));
        assert_eq!(key, "85ec1524d09017715a898824cf1aed9e");
        assert_ne!(key, detection_key(Some(100), Some("bottle"), Some(0.86), Some(ts)));
        assert_ne!(key, detection_key(Some(101), Some("bottle"), Some(0.85), Some(ts)));
    }

    #[test]
    fn missing_parts_become_empty_strings() {
        assert_eq!(
            detection_key(None, None, Some(0.5), None),
            "df09888e399d536c1be9e86dc33ac3c6"
        );
        assert_eq!(detection_key(None, None, Some(0.5), None).len(), SURROGATE_KEY_LEN);
    }
}
