//! Error types for the sandbox RPC channel.
//!
//! Two families live here: [`RpcError`], which is what a caller of
//! [`Channel`](crate::Channel) sees, and [`HandlerError`], which is what a
//! served operation returns when it fails. Handler errors are marshaled onto
//! the wire as an `exception` payload and come back out on the calling side as
//! either [`RpcError::Remote`] or [`RpcError::Rejected`].

use crate::config::RpcConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Main error type for channel operations.
#[derive(Debug, Error)]
pub enum RpcError {
    // Contract violations, reported locally and never transmitted
    #[error("RPC channel already active")]
    AlreadyActive,

    #[error("RPC channel not active")]
    NotActive,

    // Lifecycle
    #[error("RPC channel stopped")]
    Stopped,

    // Remote failures
    #[error("{0}")]
    Remote(RemoteError),

    #[error("Remote rejected call: {0}")]
    Rejected(Value),

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Create a transport error from anything printable.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        RpcError::Transport {
            message: message.to_string(),
        }
    }

    /// True when the failure came from the peer's handler rather than from
    /// this side of the channel.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_) | RpcError::Rejected(_))
    }

    /// Rebuild a caller-side error from a received `exception` payload.
    ///
    /// Payloads tagged with the structured-error flag become
    /// [`RpcError::Remote`]; anything else is passed through untouched.
    pub fn from_exception(exception: Value) -> Self {
        match ErrorPayload::from_value(&exception) {
            Some(payload) => RpcError::Remote(RemoteError {
                message: payload.message,
                stack: payload.stack,
            }),
            None => RpcError::Rejected(exception),
        }
    }
}

/// A structured error reconstituted from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub stack: Option<String>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Remote error: {}", self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Plain record a structured error is flattened into before it crosses the
/// channel: `{ message, stack, __error__: true }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(rename = "__error__")]
    pub is_error: bool,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            message: message.into(),
            stack,
            is_error: true,
        }
    }

    /// Parse a payload only if it carries the structured-error tag.
    pub fn from_value(value: &Value) -> Option<Self> {
        let tagged = value
            .get(RpcConfig::ERROR_TAG_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !tagged {
            return None;
        }

        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stack = value.get("stack").and_then(Value::as_str).map(String::from);
        Some(Self::new(message, stack))
    }

    pub fn into_value(self) -> Value {
        // Serializing a struct of strings and a bool cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Failure returned by a served operation.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// A structured error with a message and an optional stack trace.
    Error {
        message: String,
        stack: Option<String>,
    },
    /// A deliberate rejection with a plain value (a string, a data object).
    Value(Value),
}

impl HandlerError {
    /// Structured error with a stack line derived from the message.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let stack = format!("Error: {message}");
        HandlerError::Error {
            message,
            stack: Some(stack),
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        HandlerError::Error {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }

    pub fn reject(value: impl Into<Value>) -> Self {
        HandlerError::Value(value.into())
    }

    /// Error reported for a call naming an operation that is not served.
    pub fn unknown_handler(name: &str) -> Self {
        HandlerError::new(format!("RPC handler \"{name}\" is not registered"))
    }

    /// The `exception` payload sent back to the caller.
    pub fn into_exception(self) -> Value {
        match self {
            HandlerError::Error { message, stack } => ErrorPayload::new(message, stack).into_value(),
            HandlerError::Value(value) => value,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Error { message, .. } => write!(f, "{message}"),
            HandlerError::Value(value) => write!(f, "{value}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(remote) => HandlerError::Error {
                message: remote.message,
                stack: remote.stack,
            },
            RpcError::Rejected(value) => HandlerError::Value(value),
            other => HandlerError::new(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(format!("Invalid arguments: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        assert_eq!(RpcError::NotActive.to_string(), "RPC channel not active");
        assert_eq!(RpcError::AlreadyActive.to_string(), "RPC channel already active");
        assert_eq!(RpcError::Stopped.to_string(), "RPC channel stopped");
    }

    #[test]
    fn test_structured_error_marshals_with_tag() {
        let exception = HandlerError::with_stack("boom", "Error: boom\n    at double").into_exception();

        assert_eq!(
            exception,
            json!({"message": "boom", "stack": "Error: boom\n    at double", "__error__": true})
        );
    }

    #[test]
    fn test_tagged_exception_is_reconstituted() {
        let err = RpcError::from_exception(json!({
            "message": "boom",
            "stack": "Error: boom\n    at double",
            "__error__": true
        }));

        match err {
            RpcError::Remote(remote) => {
                assert_eq!(remote.message, "boom");
                assert_eq!(remote.stack.as_deref(), Some("Error: boom\n    at double"));
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_untagged_exception_passes_through() {
        let err = RpcError::from_exception(json!({"message": "not an error object"}));
        match err {
            RpcError::Rejected(value) => assert_eq!(value, json!({"message": "not an error object"})),
            other => panic!("Expected Rejected, got: {:?}", other),
        }

        let err = RpcError::from_exception(json!("nope"));
        assert!(matches!(err, RpcError::Rejected(ref v) if v == "nope"));
        assert!(err.is_remote());
    }

    #[test]
    fn test_tag_must_be_true() {
        let err = RpcError::from_exception(json!({"message": "x", "__error__": false}));
        assert!(matches!(err, RpcError::Rejected(_)));
    }

    #[test]
    fn test_handler_error_from_rpc_error_keeps_remote_details() {
        let remote = RpcError::Remote(RemoteError {
            message: "inner".into(),
            stack: Some("trace".into()),
        });
        assert_eq!(
            HandlerError::from(remote),
            HandlerError::Error {
                message: "inner".into(),
                stack: Some("trace".into())
            }
        );
        assert!(!RpcError::Stopped.is_remote());
    }
}
