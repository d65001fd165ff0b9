//! Terminal bridge: a bidirectional byte pipe between an operator WebSocket
//! and an agent WebSocket, with no server-side buffering beyond the bounded
//! channel (64 frames per direction, roughly 64 KiB of typical terminal
//! traffic). Terminal frames are dropped when a direction backs up;
//! telemetry is never routed through here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::frames::ServerFrame;
use super::AppState;
use crate::db::services::clients;
use crate::event::Event;
use crate::utils::random_string;
use crate::web::response::envelope_error;

/// Frames buffered per direction before drops kick in.
const DIRECTION_BUFFER: usize = 64;

struct Session {
    client_uuid: String,
    /// Agent-bound receiver, taken when the agent attaches.
    from_operator: Option<mpsc::Receiver<Vec<u8>>>,
    /// Operator-bound bytes, also fed by in-band `terminal_data` frames.
    to_operator: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
pub struct TerminalBridge {
    sessions: Mutex<HashMap<String, Session>>,
}

pub struct OperatorEnd {
    pub session_id: String,
    pub to_agent: mpsc::Sender<Vec<u8>>,
    pub from_agent: mpsc::Receiver<Vec<u8>>,
}

pub struct AgentEnd {
    pub to_operator: mpsc::Sender<Vec<u8>>,
    pub from_operator: mpsc::Receiver<Vec<u8>>,
}

impl TerminalBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a session on behalf of an operator; the agent attaches later by
    /// session id.
    pub fn open(&self, client_uuid: &str) -> OperatorEnd {
        let session_id = random_string(16);
        let (to_agent, from_operator) = mpsc::channel(DIRECTION_BUFFER);
        let (to_operator, from_agent) = mpsc::channel(DIRECTION_BUFFER);
        self.sessions.lock().insert(
            session_id.clone(),
            Session {
                client_uuid: client_uuid.to_owned(),
                from_operator: Some(from_operator),
                to_operator,
            },
        );
        OperatorEnd {
            session_id,
            to_agent,
            from_agent,
        }
    }

    /// Take the agent-side channel ends, verifying the session belongs to
    /// the authenticated client.
    pub fn attach_agent(&self, session_id: &str, client_uuid: &str) -> Option<AgentEnd> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(session_id)?;
        if session.client_uuid != client_uuid {
            return None;
        }
        let from_operator = session.from_operator.take()?;
        Some(AgentEnd {
            to_operator: session.to_operator.clone(),
            from_operator,
        })
    }

    /// In-band fallback for agents that multiplex terminal output on the
    /// main channel. Dropped when the operator direction is full.
    pub fn forward_to_operator(&self, session_id: &str, bytes: Vec<u8>) {
        if let Some(session) = self.sessions.lock().get(session_id) {
            if session.to_operator.try_send(bytes).is_err() {
                debug!(session = session_id, "operator direction full, dropping terminal frame");
            }
        }
    }

    pub fn close(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentTerminalQuery {
    pub token: Option<String>,
    pub session: Option<String>,
}

/// Operator side: `GET /api/admin/client/{uuid}/terminal` (admin gated by
/// the router). Opens the bridge, tells the agent to dial in, then pumps
/// bytes both ways until either side goes away.
pub async fn operator_terminal_handler(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(handle) = state.agents.get(&uuid) else {
        return envelope_error(StatusCode::NOT_FOUND, "Agent is not connected");
    };

    let OperatorEnd {
        session_id,
        to_agent,
        from_agent,
    } = state.terminals.open(&uuid);

    if handle
        .send(&ServerFrame::TerminalOpen {
            session: session_id.clone(),
        })
        .await
        .is_err()
    {
        state.terminals.close(&session_id);
        return envelope_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reach agent");
    }

    state.bus.trigger_async(Event::TerminalEstablished {
        client: uuid.clone(),
    });
    ws.on_upgrade(move |socket| {
        operator_pump(socket, state, uuid, session_id, to_agent, from_agent)
    })
}

async fn operator_pump(
    socket: WebSocket,
    state: Arc<AppState>,
    uuid: String,
    session_id: String,
    to_agent: mpsc::Sender<Vec<u8>>,
    mut from_agent: mpsc::Receiver<Vec<u8>>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    if to_agent.try_send(bytes.to_vec()).is_err() {
                        debug!(session = %session_id, "agent direction full, dropping terminal frame");
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if to_agent.try_send(text.as_bytes().to_vec()).is_err() {
                        debug!(session = %session_id, "agent direction full, dropping terminal frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session = %session_id, error = %e, "operator terminal socket error");
                    break;
                }
            },
            outgoing = from_agent.recv() => match outgoing {
                Some(bytes) => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    state.terminals.close(&session_id);
    if let Some(handle) = state.agents.get(&uuid) {
        let _ = handle
            .send(&ServerFrame::TerminalClose {
                session: session_id.clone(),
            })
            .await;
    }
    state.bus.trigger_async(Event::TerminalClosed { client: uuid });
    info!(session = %session_id, "terminal session closed");
}

/// Agent side: `GET /api/clients/terminal?token=...&session=...`.
pub async fn agent_terminal_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentTerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.unwrap_or_default();
    let client = match clients::find_by_token(&state.db, &token).await {
        Ok(Some(client)) => client,
        Ok(None) => return envelope_error(StatusCode::UNAUTHORIZED, "Invalid token"),
        Err(e) => return crate::web::error::AppError::from(e).into_response(),
    };
    let Some(session_id) = query.session else {
        return envelope_error(StatusCode::BAD_REQUEST, "session is required");
    };
    let Some(end) = state.terminals.attach_agent(&session_id, &client.uuid) else {
        return envelope_error(StatusCode::NOT_FOUND, "Unknown terminal session");
    };
    ws.on_upgrade(move |socket| agent_pump(socket, session_id, end))
}

async fn agent_pump(socket: WebSocket, session_id: String, end: AgentEnd) {
    let AgentEnd {
        to_operator,
        mut from_operator,
    } = end;
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    if to_operator.try_send(bytes.to_vec()).is_err() {
                        debug!(session = %session_id, "operator direction full, dropping terminal frame");
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if to_operator.try_send(text.as_bytes().to_vec()).is_err() {
                        debug!(session = %session_id, "operator direction full, dropping terminal frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session = %session_id, error = %e, "agent terminal socket error");
                    break;
                }
            },
            outgoing = from_operator.recv() => match outgoing {
                Some(bytes) => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!(session = %session_id, "agent terminal pump exited");
}
