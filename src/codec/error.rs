//! Uniform error records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sdk::error::UNDERLYING_ERROR as SDK_UNDERLYING_ERROR;
use crate::sdk::SdkError;

/// No session is registered for the client id
pub const CLIENT_NOT_FOUND: i64 = 9973;
/// A well-formed command carried an unusable value
pub const INVALID_PARAMETER: i64 = 9976;
/// A foreign or unclassified error was wrapped
pub const UNDERLYING_ERROR: i64 = SDK_UNDERLYING_ERROR;

/// `{code, message?, details?}` as sent to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ErrorRecord {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn client_not_found(client_id: &str) -> Self {
        let mut details = Map::new();
        details.insert("clientId".to_string(), Value::from(client_id));
        Self {
            code: CLIENT_NOT_FOUND,
            message: Some("client not found.".to_string()),
            details: Some(details),
        }
    }

    /// Wrap an error the SDK never saw
    pub fn unexpected(err: impl std::fmt::Display) -> Self {
        Self::new(UNDERLYING_ERROR, err.to_string())
    }
}

impl From<&SdkError> for ErrorRecord {
    fn from(err: &SdkError) -> Self {
        let message = if err.code == UNDERLYING_ERROR {
            err.underlying.clone().or_else(|| err.reason.clone())
        } else {
            err.reason.clone()
        };
        Self {
            code: err.code,
            message,
            details: err.details.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_domain_error_passes_through() {
        let mut details = Map::new();
        details.insert("conversationId".into(), json!("c1"));
        let err = SdkError::new(4401, "INVALID_MESSAGING_TARGET").with_details(details.clone());

        let record = ErrorRecord::from(&err);
        assert_eq!(record.code, 4401);
        assert_eq!(record.message.as_deref(), Some("INVALID_MESSAGING_TARGET"));
        assert_eq!(record.details, Some(details));
    }

    #[test]
    fn test_underlying_error_uses_wrapped_description() {
        let mut err = SdkError::underlying("connection reset by peer");
        err.reason = Some("ignored".into());

        let record = ErrorRecord::from(&err);
        assert_eq!(record.code, UNDERLYING_ERROR);
        assert_eq!(record.message.as_deref(), Some("connection reset by peer"));
    }

    #[test]
    fn test_client_not_found_wire_shape() {
        let value = serde_json::to_value(ErrorRecord::client_not_found("u1")).unwrap();
        assert_eq!(
            value,
            json!({"code": 9973, "message": "client not found.", "details": {"clientId": "u1"}})
        );
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let record = ErrorRecord {
            code: 1,
            message: None,
            details: None,
        };
        assert_eq!(serde_json::to_value(record).unwrap(), json!({"code": 1}));
    }
}
