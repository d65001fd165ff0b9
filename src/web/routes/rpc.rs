//! RPC transports: `POST /api/rpc2` for single objects and batches,
//! `GET /api/rpc2` for the persistent framed channel.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum_extra::extract::cookie::CookieJar;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::rpc::{self, RpcContext, RpcError, RpcResponse};
use crate::server::AppState;
use crate::web::middleware::auth::{remote_ip, resolve_principal, user_agent};

async fn build_context(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    jar: &CookieJar,
    query: &HashMap<String, String>,
) -> RpcContext {
    let principal =
        resolve_principal(state, headers, jar, query.get("token").map(String::as_str)).await;
    RpcContext {
        state: state.clone(),
        permission: principal.permission,
        client_uuid: principal.client_uuid,
        user_uuid: principal.user_uuid,
        remote_ip: remote_ip(headers),
        user_agent: user_agent(headers),
    }
}

/// `POST /api/rpc2`. Batches run sequentially so response ordering matches
/// request ordering; notifications produce no response element.
pub async fn rpc_http(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let context = build_context(&state, &headers, &jar, &query).await;

    let (elements, is_batch) = match rpc::parse_body(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(RpcResponse::failure(None, e)),
            )
                .into_response();
        }
    };

    let mut responses = Vec::with_capacity(elements.len());
    for element in elements {
        if let Some(response) = rpc::dispatch_value(context.clone(), element).await {
            responses.push(response);
        }
    }

    if responses.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    if is_batch {
        Json(responses).into_response()
    } else {
        Json(responses.remove(0)).into_response()
    }
}

/// `GET /api/rpc2` upgrade: one JSON-RPC request per text frame, responses
/// written as handlers finish (no cross-request ordering).
pub async fn rpc_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Response {
    let context = build_context(&state, &headers, &jar, &query).await;
    ws.on_upgrade(move |socket| handle_rpc_socket(socket, context))
}

async fn handle_rpc_socket(socket: WebSocket, context: RpcContext) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));

    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                let element: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        let response = RpcResponse::failure(
                            None,
                            RpcError::new(rpc::INVALID_REQUEST, format!("bad request: {e}")),
                        );
                        write_response(&sink, &response).await;
                        continue;
                    }
                };
                // Handlers run concurrently on this transport; the write
                // lock serializes the responses.
                let context = context.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    if let Some(response) = rpc::dispatch_value(context, element).await {
                        write_response(&sink, &response).await;
                    }
                });
            }
            Ok(Message::Ping(payload)) => {
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn write_response(
    sink: &Arc<Mutex<futures_util::stream::SplitSink<WebSocket, Message>>>,
    response: &RpcResponse,
) {
    match serde_json::to_string(response) {
        Ok(text) => {
            let mut sink = sink.lock().await;
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!(error = %e, "failed to write rpc response frame");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode rpc response"),
    }
}
