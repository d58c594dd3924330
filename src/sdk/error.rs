use serde_json::{Map, Value};

/// Code the SDK uses when it wraps a foreign error value
pub const UNDERLYING_ERROR: i64 = 9977;

/// An error raised by the messaging SDK.
///
/// Domain errors carry a stable numeric code and a reason string. Errors with
/// [`UNDERLYING_ERROR`] wrap something the SDK did not classify; `underlying`
/// then holds its string form.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("sdk error {code}: {}", self.describe())]
pub struct SdkError {
    pub code: i64,
    pub reason: Option<String>,
    pub details: Option<Map<String, Value>>,
    pub underlying: Option<String>,
}

impl SdkError {
    pub fn new(code: i64, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: Some(reason.into()),
            details: None,
            underlying: None,
        }
    }

    /// Wrap an unclassified error
    pub fn underlying(err: impl std::fmt::Display) -> Self {
        Self {
            code: UNDERLYING_ERROR,
            reason: None,
            details: None,
            underlying: Some(err.to_string()),
        }
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    fn describe(&self) -> &str {
        self.underlying
            .as_deref()
            .or(self.reason.as_deref())
            .unwrap_or("unknown")
    }
}
