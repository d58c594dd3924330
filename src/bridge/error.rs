//! Errors surfaced to the host as `{"error": {...}}` results.

use crate::codec::error::INVALID_PARAMETER;
use crate::codec::ErrorRecord;
use crate::sdk::SdkError;

/// Recoverable command failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Sdk(#[from] SdkError),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        BridgeError::InvalidParameter(message.into())
    }

    pub fn to_record(&self) -> ErrorRecord {
        match self {
            BridgeError::Sdk(err) => ErrorRecord::from(err),
            BridgeError::ClientNotFound(client_id) => ErrorRecord::client_not_found(client_id),
            BridgeError::InvalidParameter(message) => ErrorRecord::new(INVALID_PARAMETER, message.clone()),
            BridgeError::Unexpected(message) => ErrorRecord::unexpected(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::error::{CLIENT_NOT_FOUND, UNDERLYING_ERROR};
    use serde_json::json;

    #[test]
    fn test_records() {
        let record = BridgeError::ClientNotFound("u1".into()).to_record();
        assert_eq!(record.code, CLIENT_NOT_FOUND);
        assert_eq!(record.details.unwrap()["clientId"], json!("u1"));

        let record = BridgeError::invalid("member list is empty.").to_record();
        assert_eq!(record.code, INVALID_PARAMETER);
        assert_eq!(record.message.as_deref(), Some("member list is empty."));

        let record = BridgeError::Unexpected("task panicked".into()).to_record();
        assert_eq!(record.code, UNDERLYING_ERROR);
    }

    #[test]
    fn test_sdk_errors_convert() {
        let err: BridgeError = SdkError::new(4401, "gone").into();
        assert_eq!(err.to_record(), ErrorRecord::new(4401, "gone"));
    }
}
