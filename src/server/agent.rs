//! The persistent agent channel.
//!
//! One WebSocket per agent carries observation frames in and command frames
//! out. The token travels on the upgrade query or, failing that, in the
//! first frame. Any decode error or a keepalive miss closes only this
//! session; the agent is expected to reconnect with backoff.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use super::frames::AgentFrame;
use super::AppState;
use crate::db::entities::client;
use crate::db::services::{audit, clients, ping, tasks};
use crate::web::error::AppError;
use crate::web::response::envelope_error;

/// No frame for three report intervals closes the session.
const KEEPALIVE_SECONDS: u64 = 90;
/// Grace for the first (auth) frame of a connection without a query token.
const AUTH_FRAME_SECONDS: u64 = 10;
/// RFC 6455 policy violation, sent on authentication failure.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub token: Option<String>,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// `GET /api/clients/report` upgrade endpoint.
pub async fn report_ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| bearer_token(&headers));
    let client = match &token {
        Some(token) => match clients::find_by_token(&state.db, token).await {
            Ok(Some(client)) => Some(client),
            Ok(None) => {
                audit::log(&state.db, "", "", "agent auth failed (unknown token)", "warn").await;
                return envelope_error(axum::http::StatusCode::UNAUTHORIZED, "Invalid token");
            }
            Err(e) => return AppError::from(e).into_response(),
        },
        None => None,
    };
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, client))
}

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

async fn handle_agent_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    client: Option<client::Model>,
) {
    let (sink, mut stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    let client = match client {
        Some(client) => client,
        None => match wait_for_auth_frame(&state, &sink, &mut stream).await {
            Some(client) => client,
            None => return,
        },
    };

    let cancel = state.shutdown.child_token();
    let (handle, displaced) = state.agents.register(&client.uuid, sink.clone(), cancel.clone());
    if let Some(old) = displaced {
        info!(uuid = %client.uuid, "displacing previous agent connection");
        old.close(1000, "superseded by a new connection").await;
    }
    info!(uuid = %client.uuid, name = %client.name, "agent connected");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(Duration::from_secs(KEEPALIVE_SECONDS), stream.next()) => {
                match next {
                    Err(_) => {
                        warn!(uuid = %client.uuid, "keepalive missed, closing agent session");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(uuid = %client.uuid, error = %e, "agent socket error");
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<AgentFrame>(&text) {
                            Ok(frame) => handle_frame(&state, &client, frame).await,
                            Err(e) => {
                                warn!(uuid = %client.uuid, error = %e, "frame decode error, closing session");
                                break;
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let mut sink = sink.lock().await;
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    cancel.cancel();
    state.agents.deregister(&client.uuid, handle.session);
    info!(uuid = %client.uuid, "agent disconnected");
}

/// Read and validate the first frame when the upgrade carried no token.
async fn wait_for_auth_frame(
    state: &Arc<AppState>,
    sink: &SharedSink,
    stream: &mut SplitStream<WebSocket>,
) -> Option<client::Model> {
    let first = timeout(Duration::from_secs(AUTH_FRAME_SECONDS), stream.next()).await;
    let frame = match first {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AgentFrame>(&text).ok(),
        _ => None,
    };
    if let Some(AgentFrame::Auth { token }) = frame {
        match clients::find_by_token(&state.db, &token).await {
            Ok(Some(client)) => return Some(client),
            Ok(None) => {
                audit::log(&state.db, "", "", "agent auth failed (unknown token)", "warn").await;
            }
            Err(e) => warn!(error = %e, "token lookup failed during agent auth"),
        }
    }
    let mut sink = sink.lock().await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "authentication failed".into(),
        })))
        .await;
    None
}

pub(crate) async fn handle_frame(state: &Arc<AppState>, client: &client::Model, frame: AgentFrame) {
    match frame {
        // Already authenticated; a repeated auth frame carries nothing.
        AgentFrame::Auth { .. } => {}
        AgentFrame::Report(mut report) => {
            report.updated_at = Utc::now();
            state.latest.push(&client.uuid, report);
        }
        AgentFrame::BasicInfo(info) => {
            if let Err(e) = clients::update_basic_info(&state.db, &client.uuid, info).await {
                warn!(uuid = %client.uuid, error = %e, "failed to store basic info");
            }
        }
        AgentFrame::TaskResult {
            task_id,
            result,
            exit_code,
            finished_at,
        } => {
            if let Err(e) = tasks::insert_result_if_absent(
                &state.db,
                &task_id,
                &client.uuid,
                &result,
                exit_code,
                finished_at,
            )
            .await
            {
                warn!(uuid = %client.uuid, task_id, error = %e, "failed to store task result");
            }
        }
        AgentFrame::PingResult { task_id, value } => {
            if let Err(e) = ping::save_record(&state.db, task_id, &client.uuid, value).await {
                warn!(uuid = %client.uuid, task_id, error = %e, "failed to store ping result");
            }
        }
        AgentFrame::TerminalData { session, data } => {
            state
                .terminals
                .forward_to_operator(&session, data.into_bytes());
        }
    }
}
