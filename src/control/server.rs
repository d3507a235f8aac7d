//! JSON-RPC 2.0 over HTTP.
//!
//! - `GET /health` reports liveness.
//! - `POST /` accepts one JSON-RPC request: `initialize`, `ping`,
//!   `tools/list` or `tools/call`.
//!
//! Requests without an `id` are notifications and get `202 Accepted` with
//! no body.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::{codes, ToolError, ToolRegistry};

/// Protocol revision reported by `initialize`.
const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Clone)]
struct ControlState {
    tools: Arc<ToolRegistry>,
    service: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorBody>,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Router for the control endpoint.
pub fn router(tools: Arc<ToolRegistry>, service: &str) -> Router {
    let state = ControlState {
        tools,
        service: Arc::from(service),
    };

    Router::new()
        .route("/health", get(health))
        .route("/", post(rpc))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({ "ok": true, "service": &*state.service }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(RpcResponse::error(
            Value::Null,
            codes::METHOD_NOT_FOUND,
            "Not found",
        )),
    )
        .into_response()
}

async fn rpc(State(state): State<ControlState>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Invalid JSON received on control endpoint");
            return (
                StatusCode::BAD_REQUEST,
                Json(RpcResponse::error(
                    Value::Null,
                    codes::PARSE_ERROR,
                    "Parse error: invalid JSON",
                )),
            )
                .into_response();
        }
    };

    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return Json(RpcResponse::error(
                Value::Null,
                codes::INVALID_REQUEST,
                format!("Invalid request: {}", e),
            ))
            .into_response();
        }
    };

    let Some(id) = request.id else {
        debug!(method = %request.method, "Notification received");
        return StatusCode::ACCEPTED.into_response();
    };

    Json(handle(&state, id, &request.method, request.params).await).into_response()
}

async fn handle(state: &ControlState, id: Value, method: &str, params: Value) -> RpcResponse {
    match method {
        "initialize" => RpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": &*state.service, "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "ping" => RpcResponse::success(id, json!({})),
        "tools/list" => RpcResponse::success(id, state.tools.list()),
        "tools/call" => {
            let call: CallParams = match serde_json::from_value(params) {
                Ok(call) => call,
                Err(e) => {
                    return RpcResponse::error(
                        id,
                        codes::INVALID_PARAMS,
                        format!("Invalid params: {}", e),
                    )
                }
            };

            match state.tools.call(&call.name, call.arguments).await {
                Ok(text) => RpcResponse::success(
                    id,
                    json!({ "content": [{ "type": "text", "text": text }] }),
                ),
                Err(e) => {
                    if matches!(e, ToolError::Failed(_)) {
                        warn!(tool = %call.name, error = %e, "Tool call failed");
                    }
                    RpcResponse::error(id, e.code(), e.to_string())
                }
            }
        }
        other => RpcResponse::error(
            id,
            codes::METHOD_NOT_FOUND,
            format!("Method '{}' not found", other),
        ),
    }
}
