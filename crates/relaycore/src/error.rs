use thiserror::Error;

/// Error taxonomy for every relay operation.
///
/// Transient delivery failures (a dead live channel) are deliberately absent:
/// the broadcaster drops such channels and never reports them to publishers.
/// Notifier failures are values too, see [`crate::notifier::NotifyOutcome`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A required field (category, identifier, user id, payload) is missing or malformed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Category name outside the fixed enumeration
    #[error("Unknown type: {0}")]
    UnknownCategory(String),

    /// Operation does not fit the category's declared shape
    #[error("Category '{category}' does not support {operation}")]
    UnsupportedOperation { category: String, operation: &'static str },

    /// Anything else; surfaced to callers as a generic server fault
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        RelayError::Validation(msg.into())
    }

    /// True for errors caused by the caller's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, RelayError::Internal(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Validation(err.to_string())
    }
}

/// Type alias for Result with RelayError
pub type RelayResult<T> = Result<T, RelayError>;
