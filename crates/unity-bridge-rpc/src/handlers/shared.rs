//! Shared handler utilities used across RPC domains.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use unity_bridge::{BridgeError, ToolError};

/// Extract an optional string parameter, supporting both snake_case and camelCase.
pub(crate) fn get_str_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
pub(crate) fn require_str_param(
    params: &Value,
    snake: &str,
    camel: &str,
) -> Result<String, ToolError> {
    get_str_param(params, snake, camel)
        .map(String::from)
        .ok_or_else(|| ToolError::invalid_params(format!("Missing required parameter: {}", snake)))
}

/// Extract an optional u64 parameter. Present but not a u64 is an error.
pub(crate) fn get_u64_param(
    params: &Value,
    snake: &str,
    camel: &str,
) -> Result<Option<u64>, ToolError> {
    match params.get(snake).or_else(|| params.get(camel)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            ToolError::invalid_params(format!(
                "Parameter {} must be a non-negative integer",
                snake
            ))
        }),
    }
}

/// Deadline from an optional `timeout_ms` parameter.
pub(crate) fn deadline_param(params: &Value) -> Result<Option<Instant>, ToolError> {
    match get_u64_param(params, "timeout_ms", "timeoutMs")? {
        None => Ok(None),
        Some(0) => Err(ToolError::invalid_params("timeout_ms must be positive")),
        Some(ms) => Ok(Some(Instant::now() + Duration::from_millis(ms))),
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::from(BridgeError::from(e)))
}
