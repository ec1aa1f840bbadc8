//! Error codes and their retry semantics.
//!
//! Every failure a caller can observe is a [`ToolError`]. What it means for
//! the caller (may it retry, did the editor run the command, what should it do
//! next) is not carried by the error itself but looked up in the
//! [`ErrorSemanticsResolver`] table, so the classification lives in one place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Stable error codes exposed to the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Editor link is down and did not come back within the reconnect wait.
    EditorNotReady,
    /// Editor stayed compiling/reloading past the compile grace.
    CompileTimeout,
    /// Link dropped after the request was sent; outcome unknown.
    ReconnectTimeout,
    /// Link dropped (or was absent) before the request was sent.
    UnityDisconnected,
    /// Admission queue is full.
    QueueFull,
    /// Editor accepted the request but did not answer in time.
    RequestTimeout,
    /// Caller cancelled the request.
    RequestCancelled,
    /// Editor executed the command and reported a failure.
    EditorCommandFailed,
    InvalidParams,
    InvalidConfig,
    /// Bridge is shutting down.
    ServerStopping,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::EditorNotReady => "EDITOR_NOT_READY",
            ErrorCode::CompileTimeout => "COMPILE_TIMEOUT",
            ErrorCode::ReconnectTimeout => "RECONNECT_TIMEOUT",
            ErrorCode::UnityDisconnected => "UNITY_DISCONNECTED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::RequestCancelled => "REQUEST_CANCELLED",
            ErrorCode::EditorCommandFailed => "EDITOR_COMMAND_FAILED",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::ServerStopping => "SERVER_STOPPING",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing claim about whether a failed request ran on the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionGuarantee {
    NotExecuted,
    Executed,
    Unknown,
}

/// What a caller should do after seeing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryAllowed,
    InspectStateThenRetryIfNeeded,
    BackoffThenRetry,
    FixInputThenRetry,
    DoNotRetry,
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorSemantics {
    pub retryable: bool,
    pub execution_guarantee: ExecutionGuarantee,
    pub recovery_action: RecoveryAction,
}

impl ErrorSemantics {
    pub const fn new(
        retryable: bool,
        execution_guarantee: ExecutionGuarantee,
        recovery_action: RecoveryAction,
    ) -> Self {
        Self {
            retryable,
            execution_guarantee,
            recovery_action,
        }
    }

    /// Used for codes with no table entry: assume the command may have run.
    pub const CONSERVATIVE: ErrorSemantics = ErrorSemantics::new(
        false,
        ExecutionGuarantee::Unknown,
        RecoveryAction::InspectStateThenRetryIfNeeded,
    );
}

/// Point in a request's lifecycle at which a transport failure was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    BeforeSend,
    AfterSend,
}

impl DispatchStage {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStage::BeforeSend => "before_send",
            DispatchStage::AfterSend => "after_send",
        }
    }

    /// Stage implied by a request's transmitted flag.
    pub fn from_transmitted(transmitted: bool) -> Self {
        if transmitted {
            DispatchStage::AfterSend
        } else {
            DispatchStage::BeforeSend
        }
    }
}

/// Structured caller-facing error: code, message, optional details.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Map<String, Value>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Attach (or overwrite) one structured detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn unity_disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnityDisconnected, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }
}

/// Wire shape of an error handed to the RPC layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub details: Map<String, Value>,
}

/// Central, extensible classification table.
#[derive(Debug, Clone)]
pub struct ErrorSemanticsResolver {
    table: HashMap<ErrorCode, ErrorSemantics>,
}

impl Default for ErrorSemanticsResolver {
    fn default() -> Self {
        use ExecutionGuarantee::{Executed, NotExecuted, Unknown};
        use RecoveryAction::*;

        let table = HashMap::from([
            (
                ErrorCode::EditorNotReady,
                ErrorSemantics::new(true, NotExecuted, RetryAllowed),
            ),
            (
                ErrorCode::ReconnectTimeout,
                ErrorSemantics::new(false, Unknown, InspectStateThenRetryIfNeeded),
            ),
            (
                ErrorCode::UnityDisconnected,
                ErrorSemantics::new(true, NotExecuted, RetryAllowed),
            ),
            (
                ErrorCode::CompileTimeout,
                ErrorSemantics::new(true, NotExecuted, RetryAllowed),
            ),
            (
                ErrorCode::QueueFull,
                ErrorSemantics::new(true, NotExecuted, BackoffThenRetry),
            ),
            (
                ErrorCode::RequestTimeout,
                ErrorSemantics::new(false, Unknown, InspectStateThenRetryIfNeeded),
            ),
            (
                ErrorCode::RequestCancelled,
                ErrorSemantics::new(false, NotExecuted, DoNotRetry),
            ),
            (
                ErrorCode::EditorCommandFailed,
                ErrorSemantics::new(false, Executed, InspectStateThenRetryIfNeeded),
            ),
            (
                ErrorCode::InvalidParams,
                ErrorSemantics::new(false, NotExecuted, FixInputThenRetry),
            ),
            (
                ErrorCode::InvalidConfig,
                ErrorSemantics::new(false, NotExecuted, FixInputThenRetry),
            ),
            (
                ErrorCode::ServerStopping,
                ErrorSemantics::new(false, NotExecuted, DoNotRetry),
            ),
        ]);

        Self { table }
    }
}

impl ErrorSemanticsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or override the entry for `code`.
    pub fn register(&mut self, code: ErrorCode, semantics: ErrorSemantics) {
        self.table.insert(code, semantics);
    }

    /// Look up the semantics for `code`.
    ///
    /// Unmapped codes get [`ErrorSemantics::CONSERVATIVE`]: not retryable,
    /// execution unknown, inspect state before retrying.
    pub fn resolve(&self, code: ErrorCode) -> ErrorSemantics {
        self.table
            .get(&code)
            .copied()
            .unwrap_or(ErrorSemantics::CONSERVATIVE)
    }

    /// Rewrite a transport-disconnect failure according to when it was seen.
    ///
    /// - `BeforeSend`: keeps `UNITY_DISCONNECTED`; the editor never saw it.
    /// - `AfterSend`: becomes `RECONNECT_TIMEOUT`; the editor may have run it.
    ///
    /// Other codes are returned untouched.
    pub fn normalize_dispatch_failure(&self, error: ToolError, stage: DispatchStage) -> ToolError {
        if error.code != ErrorCode::UnityDisconnected {
            return error;
        }

        let mut normalized = match stage {
            DispatchStage::BeforeSend => error,
            DispatchStage::AfterSend => ToolError {
                code: ErrorCode::ReconnectTimeout,
                ..error
            },
        };
        normalized
            .details
            .insert("dispatch_stage".to_string(), stage.as_str().into());
        normalized
    }

    /// Semantics for a concrete error, taking its `dispatch_stage` detail
    /// into account.
    ///
    /// A known stage overrides the table's execution guarantee: `before_send`
    /// is always `NotExecuted`, and `after_send` is always `Unknown`, not
    /// retryable, and requires inspecting editor state first.
    pub fn semantics_for(&self, error: &ToolError) -> ErrorSemantics {
        let semantics = self.resolve(error.code);
        match error.detail("dispatch_stage").and_then(Value::as_str) {
            Some("before_send") => ErrorSemantics {
                execution_guarantee: ExecutionGuarantee::NotExecuted,
                ..semantics
            },
            Some("after_send") => ErrorSemantics {
                retryable: false,
                execution_guarantee: ExecutionGuarantee::Unknown,
                recovery_action: RecoveryAction::InspectStateThenRetryIfNeeded,
            },
            _ => semantics,
        }
    }

    /// Build the payload handed to the RPC layer.
    pub fn to_payload(&self, error: &ToolError) -> ToolErrorPayload {
        let semantics = self.semantics_for(error);
        let mut details = error.details.clone();
        details.insert(
            "execution_guarantee".to_string(),
            serde_json::to_value(semantics.execution_guarantee).unwrap_or(Value::Null),
        );
        details.insert(
            "recovery_action".to_string(),
            serde_json::to_value(semantics.recovery_action).unwrap_or(Value::Null),
        );

        ToolErrorPayload {
            code: error.code,
            message: error.message.clone(),
            retryable: semantics.retryable,
            details,
        }
    }
}
