//! Handlers that forward work to the editor.

use super::shared::deadline_param;
use super::{get_str_param, require_str_param};
use crate::server::AppState;
use serde_json::{json, Map, Value};
use tracing::warn;
use unity_bridge::{CancellationToken, JobState, ToolError};

/// Editor command that reports a job's progress.
const JOB_STATUS_COMMAND: &str = "get_job_status";

pub(crate) async fn call_editor(state: &AppState, params: &Value) -> Result<Value, ToolError> {
    let command = require_str_param(params, "command", "command")?;
    let deadline = deadline_param(params)?;
    let command_params = match params.get("params") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => value.clone(),
    };

    let cancel = CancellationToken::new();
    state
        .bridge
        .dispatch_with_deadline(command, command_params, &cancel, deadline)
        .await
}

/// Forward a job status query and check the `job_state` token it returns.
///
/// The canonical token replaces whatever the editor sent and
/// `job_state_recognized` tells the caller whether it could be parsed.
pub(crate) async fn get_job_status(state: &AppState, params: &Value) -> Result<Value, ToolError> {
    let job_id = require_str_param(params, "job_id", "jobId")?;
    let deadline = deadline_param(params)?;

    let cancel = CancellationToken::new();
    let result = state
        .bridge
        .dispatch_with_deadline(JOB_STATUS_COMMAND, json!({ "job_id": job_id }), &cancel, deadline)
        .await?;

    let raw = get_str_param(&result, "job_state", "jobState").map(String::from);
    let (job_state, recognized) = JobState::parse_wire(raw.as_deref().unwrap_or_default());
    if !recognized {
        warn!("Job {} reported unrecognized state {:?}", job_id, raw);
    }

    let mut response = match result {
        Value::Object(obj) => obj,
        other => {
            let mut obj = Map::new();
            obj.insert("result".to_string(), other);
            obj
        }
    };
    if !recognized {
        response.insert("raw_job_state".to_string(), raw.map_or(Value::Null, Value::String));
    }
    response.insert("job_id".to_string(), Value::String(job_id));
    response.insert("job_state".to_string(), job_state.as_wire().into());
    response.insert("job_state_recognized".to_string(), recognized.into());
    response.insert("terminal".to_string(), (recognized && job_state.is_terminal()).into());
    Ok(Value::Object(response))
}
