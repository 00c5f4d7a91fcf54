//! JSON-RPC request handlers and the notification stream.

use crate::server::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::stream::{self, Stream};
use mxkernel::{CallArgs, KernelError, Reply};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

/// Seconds between keep-alive comments on the event stream.
const KEEP_ALIVE_SECS: u64 = 15;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
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
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
///
/// `method` names a registered operation; `params` is either a positional
/// array or a keyword object.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let id = request.id.clone();
    let method = request.method;

    debug!("RPC call: {}({:?})", method, request.params);

    // Handle built-in methods
    if method == "health_check" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(id, json!({"status": "ok"}))),
        );
    }

    if method == "list_operations" {
        let names = state.session.lock().await.registry().names();
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(id, json!(names))),
        );
    }

    let result = match CallArgs::from_params(request.params) {
        Ok(args) => dispatch(&state, method.clone(), args).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(reply) => (StatusCode::OK, Json(JsonRpcResponse::success(id, reply.to_json()))),
        Err(e) => {
            match &e {
                KernelError::Resolution { .. } | KernelError::ValueNotReady { .. } => {
                    debug!("RPC error for {}: {}", method, e)
                }
                _ => error!("RPC error for {}: {}", method, e),
            }
            let code = e.to_rpc_error_code();
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, code, e.to_string())),
            )
        }
    }
}

/// Run one operation on a blocking worker; evaluation may recurse deeply.
async fn dispatch(state: &AppState, method: String, args: CallArgs) -> mxkernel::Result<Reply> {
    let session = Arc::clone(&state.session);
    tokio::task::spawn_blocking(move || session.blocking_lock().dispatch(&method, &args))
        .await
        .map_err(|e| KernelError::Other(format!("Dispatch task failed: {}", e)))?
}

/// Stream kernel notifications as server-sent events.
pub async fn handle_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.publisher.subscribe();

    let stream = stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(notification) => {
                let data = notification.to_json().to_string();
                let event = Event::default().event(notification.msg_type).data(data);
                Some((Ok(event), rx))
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event subscriber lagged, {} notification(s) dropped", skipped);
                Some((Ok(Event::default().comment("lagged")), rx))
            }
            Err(RecvError::Closed) => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shape() {
        let response = JsonRpcResponse::error(Some(json!(7)), -32601, "nope".to_string());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["code"], json!(-32601));
        assert_eq!(value["id"], json!(7));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_success_response_keeps_null_result() {
        let response = JsonRpcResponse::success(None, Value::Null);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["jsonrpc"], json!("2.0"));
        assert!(value["result"].is_null());
        assert!(value.get("error").is_none());
    }
}
