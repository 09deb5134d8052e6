//! Error handling for the Waiter scheduler
//!
//! Provides a unified error type and result type for use across all
//! scheduler components.

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The orchestrator object or service does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The orchestrator rejected the mutation because of a concurrent write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request was malformed or rejected as invalid
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Network-level failure talking to the orchestrator
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested operation is not supported by this backend
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Authentication with the orchestrator failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Internal error, including unexpected orchestrator responses
    #[error("Internal error (status {status:?}): {message}")]
    Internal {
        /// HTTP status attached when the orchestrator answered at all
        status: Option<u16>,
        /// Human-readable detail
        message: String,
    },

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a malformed-request error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an authentication error
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create an internal error without an attached status
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            status: None,
            message: msg.into(),
        }
    }

    /// Classify an orchestrator HTTP status into the error taxonomy
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            400 => Self::Malformed(detail),
            401 | 403 => Self::AuthFailed(detail),
            404 => Self::NotFound(detail),
            409 => Self::Conflict(detail),
            _ => Self::Internal {
                status: Some(status),
                message: detail,
            },
        }
    }

    /// HTTP status that best represents this error in operation results
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Malformed(_) | Error::Unsupported(_) => 400,
            Error::AuthFailed(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Transport(_) => 502,
            Error::Internal {
                status: Some(status),
                ..
            } => *status,
            _ => 500,
        }
    }

    /// Check if this error is retryable against the orchestrator
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Transport(_))
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Malformed(_) => "malformed",
            Error::Transport(_) => "transport",
            Error::Unsupported(_) => "unsupported",
            Error::AuthFailed(_) => "auth_failed",
            Error::Internal { .. } => "internal",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
            Error::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(Error::from_status(400, "x"), Error::Malformed(_)));
        assert!(matches!(Error::from_status(404, "x"), Error::NotFound(_)));
        assert!(matches!(Error::from_status(409, "x"), Error::Conflict(_)));
        assert!(matches!(Error::from_status(403, "x"), Error::AuthFailed(_)));

        match Error::from_status(503, "unavailable") {
            Error::Internal { status, message } => {
                assert_eq!(status, Some(503));
                assert_eq!(message, "unavailable");
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_http_status_round_trip() {
        assert_eq!(Error::from_status(404, "x").http_status(), 404);
        assert_eq!(Error::from_status(409, "x").http_status(), 409);
        assert_eq!(Error::from_status(502, "x").http_status(), 502);
        assert_eq!(Error::unsupported("docker").http_status(), 400);
        assert_eq!(Error::internal("boom").http_status(), 500);
    }

    #[test]
    fn test_retryability() {
        assert!(Error::conflict("patch raced").is_retryable());
        assert!(Error::transport("connection reset").is_retryable());
        assert!(!Error::not_found("gone").is_retryable());
        assert!(!Error::unsupported("docker").is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(Error::not_found("x").category(), "not_found");
        assert_eq!(Error::transport("x").category(), "transport");
        assert_eq!(Error::internal("x").category(), "internal");
    }
}
