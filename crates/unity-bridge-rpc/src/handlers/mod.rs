//! RPC method handlers, grouped by domain.

mod editor;
mod shared;
mod status;

use crate::server::AppState;
use serde_json::Value;
use unity_bridge::ToolError;

pub(crate) use shared::{get_str_param, require_str_param, to_json};

/// Why a method call produced no result.
#[derive(Debug)]
pub(crate) enum MethodError {
    NotFound(String),
    Tool(ToolError),
}

impl From<ToolError> for MethodError {
    fn from(err: ToolError) -> Self {
        MethodError::Tool(err)
    }
}

/// Route `method` to its handler.
pub(crate) async fn dispatch_method(
    state: &AppState,
    method: &str,
    params: &Value,
) -> Result<Value, MethodError> {
    let result = match method {
        "ping" => Ok(Value::String("pong".to_string())),
        "get_editor_status" => status::get_editor_status(state, params),
        "get_wait_policy" => status::get_wait_policy(state, params),
        "call_editor" => editor::call_editor(state, params).await,
        "get_job_status" => editor::get_job_status(state, params).await,
        _ => return Err(MethodError::NotFound(method.to_string())),
    };
    result.map_err(MethodError::from)
}
