//! Conversion between SDK objects and the plain records sent to the host.

pub mod conversation;
pub mod error;
pub mod file;
pub mod message;
pub mod typed;

use chrono::{DateTime, Utc};

pub use conversation::ConversationRecord;
pub use error::ErrorRecord;
pub use file::FileParam;
pub use message::MessageRecord;

/// Render a date the way the host expects it (`2024-01-19T18:40:00.000Z`)
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Current time as a host date string
pub fn now_string() -> String {
    format_date(&Utc::now())
}

/// Serde adapter carrying optional byte payloads as base64 strings
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_date_has_millis() {
        let date = Utc.with_ymd_and_hms(2024, 1, 19, 18, 40, 0).unwrap();
        assert_eq!(format_date(&date), "2024-01-19T18:40:00.000Z");
    }
}
