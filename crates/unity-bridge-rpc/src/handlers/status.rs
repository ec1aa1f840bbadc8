//! Bridge status handlers.

use super::to_json;
use crate::server::AppState;
use serde_json::Value;
use unity_bridge::ToolError;

pub(crate) fn get_editor_status(state: &AppState, _params: &Value) -> Result<Value, ToolError> {
    let mut response = to_json(&state.bridge.snapshot())?;
    if let Some(obj) = response.as_object_mut() {
        obj.insert(
            "queued_requests".to_string(),
            state.bridge.queued_requests().into(),
        );
    }
    Ok(response)
}

/// Policy a caller arriving now would wait under.
pub(crate) fn get_wait_policy(state: &AppState, _params: &Value) -> Result<Value, ToolError> {
    let snapshot = state.bridge.snapshot();
    let policy = state.bridge.resolve_editor_ready_wait_policy(&snapshot);
    let mut response = to_json(&policy)?;
    if let Some(obj) = response.as_object_mut() {
        obj.insert("waiting_reason".to_string(), to_json(&snapshot.waiting_reason)?);
    }
    Ok(response)
}
