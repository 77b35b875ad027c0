//! Error taxonomy for the call engine
//!
//! Every failure a caller can observe is one of five kinds. Collaborators
//! (codec, transport, durable store) must map their own failures into this
//! taxonomy; the engine never surfaces an opaque error.

use serde::{Deserialize, Serialize};

/// Coarse classification of an [`RpcError`], used by cache fallback policies
/// and error handler resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport or network failure, including timeouts
    Connection,
    /// Malformed or mismatched wire response
    Parse,
    /// The call was cancelled locally
    Cancelled,
    /// The remote peer reported an application-level failure
    Api,
    /// Invalid policy combination or unknown method
    Configuration,
}

/// Unified error type for all engine operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum RpcError {
    /// Transport or network failure
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the failure
        message: String,
        /// Whether the failure was the timeout budget expiring
        timed_out: bool,
    },

    /// Malformed or mismatched wire response
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the failure
        message: String,
    },

    /// The call was cancelled before it could complete
    #[error("Call cancelled")]
    Cancelled,

    /// Application-level failure reported by the remote peer
    #[error("API error {code}: {message}")]
    Api {
        /// Peer-defined error code
        code: i64,
        /// Peer-supplied message
        message: String,
    },

    /// Invalid configuration, detected eagerly
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the invalid configuration
        message: String,
    },
}

impl RpcError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a connection error caused by an expired timeout budget
    pub fn timeout(budget_ms: u64) -> Self {
        Self::Connection {
            message: format!("no response within {budget_ms}ms"),
            timed_out: true,
        }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create an application-level error
    pub fn api(code: i64, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Api { .. } => ErrorKind::Api,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// True for transport-class failures
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// True if the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Build a new error of the same kind whose message is prefixed with
    /// `context`. The original value is left untouched.
    pub fn with_context(&self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::Connection { message, timed_out } => Self::Connection {
                message: format!("{context}: {message}"),
                timed_out: *timed_out,
            },
            Self::Parse { message } => Self::parse(format!("{context}: {message}")),
            Self::Cancelled => Self::Cancelled,
            Self::Api { code, message } => Self::api(*code, format!("{context}: {message}")),
            Self::Configuration { message } => {
                Self::configuration(format!("{context}: {message}"))
            }
        }
    }
}

/// Standard Result type for engine operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Connection {
                message: err.to_string(),
                timed_out: true,
            },
            _ => Self::connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RpcError::api(404, "no such city");
        assert_eq!(err.kind(), ErrorKind::Api);
        assert_eq!(err.to_string(), "API error 404: no such city");
    }

    #[test]
    fn test_context_builds_new_error() {
        let original = RpcError::timeout(250);
        let wrapped = original.with_context("forecast");
        assert!(matches!(
            wrapped,
            RpcError::Connection { timed_out: true, ref message } if message.starts_with("forecast: ")
        ));
        // The source error keeps its own message.
        assert_eq!(original.to_string(), "Connection error: no response within 250ms");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow peer");
        let err = RpcError::from(io_err);
        assert!(err.is_connection());
        assert!(matches!(err, RpcError::Connection { timed_out: true, .. }));
    }

    #[test]
    fn test_json_conversion_is_parse() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(RpcError::from(json_err).kind(), ErrorKind::Parse);
    }
}
