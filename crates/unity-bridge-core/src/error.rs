//! Error types for the bridge core.
//!
//! `BridgeError` covers infrastructure failures (configuration, framing, IO).
//! Anything that reaches a tool caller is converted into a
//! [`ToolError`](crate::semantics::ToolError) first, so callers only ever see
//! classified codes.

use crate::semantics::{ErrorCode, ToolError};
use thiserror::Error;

/// Main error type for the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration rejected by validation
    #[error("Invalid configuration for {field}: {message}")]
    Config { field: String, message: String },

    /// Admission queue rejected a request
    #[error("Admission queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Encoded message larger than one link frame may carry
    #[error("Frame of {size} bytes exceeds the maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Editor link protocol violation (bad frame, unexpected message)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

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

    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    /// Map onto the caller-facing code table.
    ///
    /// IO failures surface as `UNITY_DISCONNECTED`; the dispatch path then
    /// decides whether that happened before or after the request was sent.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            BridgeError::Config { .. } => ErrorCode::InvalidConfig,
            BridgeError::QueueFull { .. } => ErrorCode::QueueFull,
            BridgeError::FrameTooLarge { .. } => ErrorCode::InvalidParams,
            BridgeError::Io { .. } => ErrorCode::UnityDisconnected,
            BridgeError::Protocol { .. } | BridgeError::Json { .. } | BridgeError::Other(_) => {
                ErrorCode::Internal
            }
        }
    }
}

impl From<BridgeError> for ToolError {
    fn from(err: BridgeError) -> Self {
        let code = err.error_code();
        let tool_error = ToolError::new(code, err.to_string());
        match err {
            BridgeError::Config { field, .. } => tool_error.with_detail("field", field),
            BridgeError::QueueFull { capacity } => tool_error.with_detail("capacity", capacity),
            BridgeError::FrameTooLarge { size, max } => tool_error
                .with_detail("frame_bytes", size)
                .with_detail("max_frame_bytes", max),
            _ => tool_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::config("queue_capacity", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for queue_capacity: must be greater than 0"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BridgeError::QueueFull { capacity: 4 }.error_code(),
            ErrorCode::QueueFull
        );
        assert_eq!(
            BridgeError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).error_code(),
            ErrorCode::UnityDisconnected
        );
        assert_eq!(
            BridgeError::protocol("bad frame").error_code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_into_tool_error_keeps_context() {
        let tool: ToolError = BridgeError::config("reconnect_wait", "must be non-zero").into();
        assert_eq!(tool.code, ErrorCode::InvalidConfig);
        assert_eq!(tool.detail("field"), Some(&serde_json::json!("reconnect_wait")));
    }

    #[test]
    fn test_oversized_frame_is_invalid_params() {
        let tool: ToolError = BridgeError::FrameTooLarge { size: 20, max: 10 }.into();
        assert_eq!(tool.code, ErrorCode::InvalidParams);
        assert_eq!(tool.detail("frame_bytes"), Some(&serde_json::json!(20)));
        assert_eq!(tool.detail("max_frame_bytes"), Some(&serde_json::json!(10)));
    }
}
