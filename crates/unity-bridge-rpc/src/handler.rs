//! JSON-RPC request handlers.

use crate::handlers::{dispatch_method, MethodError};
use crate::server::AppState;
use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use unity_bridge::ToolErrorPayload;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Classified bridge failure; `data` carries the payload.
pub const TOOL_ERROR: i32 = -32000;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    pub fn tool_error(id: Option<Value>, payload: ToolErrorPayload) -> Self {
        let message = payload.message.clone();
        let data = serde_json::to_value(&payload).ok();
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code: TOOL_ERROR,
                message,
                data,
            }),
            id,
        }
    }
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.bridge.snapshot();
    Json(json!({
        "status": "ok",
        "server_state": snapshot.server_state,
        "connected": snapshot.connected,
    }))
}

/// Main JSON-RPC handler.
///
/// The body is taken raw so malformed JSON and malformed envelopes get
/// JSON-RPC errors instead of HTTP rejections.
pub async fn handle_rpc(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    None,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                )),
            );
        }
    };

    let id = value.get("id").cloned();
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    id,
                    INVALID_REQUEST,
                    format!("Invalid request: {}", e),
                )),
            );
        }
    };
    if request.jsonrpc != "2.0" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                format!("Invalid request: unsupported jsonrpc version {:?}", request.jsonrpc),
            )),
        );
    }

    let method = request.method.as_str();
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    debug!("RPC call: {}({:?})", method, params);

    match dispatch_method(&state, method, &params).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(MethodError::NotFound(method)) => (
            StatusCode::OK,
            Json(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            )),
        ),
        Err(MethodError::Tool(e)) => {
            warn!("RPC error for {}: {}", method, e);
            let payload = state.bridge.error_payload(&e);
            (StatusCode::OK, Json(JsonRpcResponse::tool_error(id, payload)))
        }
    }
}
