//! Process-wide map of live agent connections.
//!
//! One entry per client uuid; registering a second connection for the same
//! uuid displaces the first so a network flap never leaves a zombie session
//! holding the slot. All server-to-agent writes go through the handle's
//! serialized sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::frames::ServerFrame;

/// A telemetry write that cannot make progress for this long closes the
/// session rather than buffering without bound.
const SEND_STALL_SECONDS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("send stalled past {SEND_STALL_SECONDS}s, session closed")]
    Stalled,
}

pub struct AgentHandle {
    pub uuid: String,
    pub session: u64,
    pub connected_at: DateTime<Utc>,
    sender: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    cancel: CancellationToken,
}

impl AgentHandle {
    /// Send one command frame. Writes are serialized by the sender mutex; a
    /// stalled or failed write cancels the whole session.
    pub async fn send(&self, frame: &ServerFrame) -> Result<(), SendError> {
        let text = serde_json::to_string(frame)?;
        let mut sink = self.sender.lock().await;
        let send = sink.send(Message::Text(text.into()));
        match tokio::time::timeout(std::time::Duration::from_secs(SEND_STALL_SECONDS), send).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.cancel.cancel();
                Err(SendError::Closed(e.to_string()))
            }
            Err(_) => {
                self.cancel.cancel();
                Err(SendError::Stalled)
            }
        }
    }

    /// Best-effort close frame followed by session cancellation.
    pub async fn close(&self, code: u16, reason: &str) {
        let mut sink = self.sender.lock().await;
        let frame = Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_owned().into(),
        }));
        if let Err(e) = sink.send(frame).await {
            warn!(uuid = %self.uuid, error = %e, "failed to send close frame");
        }
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    next_session: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install a fresh connection for `uuid`, returning the new handle and
    /// the displaced one, if any.
    pub fn register(
        &self,
        uuid: &str,
        sender: Arc<Mutex<SplitSink<WebSocket, Message>>>,
        cancel: CancellationToken,
    ) -> (Arc<AgentHandle>, Option<Arc<AgentHandle>>) {
        let handle = Arc::new(AgentHandle {
            uuid: uuid.to_owned(),
            session: self.next_session.fetch_add(1, Ordering::Relaxed),
            connected_at: Utc::now(),
            sender,
            cancel,
        });
        let displaced = self
            .agents
            .write()
            .insert(uuid.to_owned(), handle.clone());
        (handle, displaced)
    }

    /// Remove the entry only when it still belongs to the given session; a
    /// displaced connection must not tear down its successor.
    pub fn deregister(&self, uuid: &str, session: u64) {
        let mut agents = self.agents.write();
        if agents.get(uuid).map(|h| h.session) == Some(session) {
            agents.remove(uuid);
        }
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<AgentHandle>> {
        self.agents.read().get(uuid).cloned()
    }

    pub fn is_online(&self, uuid: &str) -> bool {
        self.agents.read().contains_key(uuid)
    }

    pub fn online_uuids(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<AgentHandle>> {
        self.agents.read().values().cloned().collect()
    }
}
