//! Server runtime state and the agent-facing channel.

pub mod agent;
pub mod frames;
pub mod latest;
pub mod registry;
pub mod terminal;

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::event::{Event, EventBus, Topic};
use crate::notifications::NotificationHub;
use crate::rpc::RpcRegistry;
use crate::scheduler::ping::PingScheduler;
use latest::LatestStateCache;
use registry::AgentRegistry;
use terminal::TerminalBridge;

/// Shared state handed to every handler.
pub struct AppState {
    pub db: DatabaseConnection,
    pub bus: Arc<EventBus>,
    pub config: Arc<ConfigStore>,
    pub agents: Arc<AgentRegistry>,
    pub latest: Arc<LatestStateCache>,
    pub ping: Arc<PingScheduler>,
    pub notifier: Arc<NotificationHub>,
    pub rpc: Arc<RpcRegistry>,
    pub terminals: Arc<TerminalBridge>,
    pub shutdown: CancellationToken,
}

/// Listeners reacting to client lifecycle events: a deleted client loses
/// its live connection and its report window, and the ping schedule drops
/// it from every task.
pub fn register_lifecycle_listeners(state: &Arc<AppState>) {
    let st = state.clone();
    state.bus.on(Topic::ClientDeleted, 0, move |event| {
        let st = st.clone();
        async move {
            if let Event::ClientDeleted { uuid, .. } = event.as_ref() {
                if let Some(handle) = st.agents.get(uuid) {
                    handle.close(1000, "client deleted").await;
                }
                st.latest.remove(uuid);
                st.ping
                    .reload()
                    .await
                    .map_err(crate::event::EventError::Db)?;
            }
            Ok(())
        }
    });

    // The ping schedule converges on the store once routing is up.
    let st = state.clone();
    state.bus.on(Topic::ServerInitDone, 0, move |_| {
        let st = st.clone();
        async move {
            st.ping
                .reload()
                .await
                .map_err(crate::event::EventError::Db)?;
            Ok(())
        }
    });

    // Failed logins leave an audit trail with the submitted username and
    // source address; the HTTP response stays generic.
    let st = state.clone();
    state.bus.on(Topic::LoginFailed, 0, move |event| {
        let st = st.clone();
        async move {
            if let Event::LoginFailed { username, method, ip, .. } = event.as_ref() {
                crate::db::services::audit::log(
                    &st.db,
                    ip,
                    "",
                    &format!("login failed for {username:?} ({method})"),
                    "login",
                )
                .await;
            }
            Ok(())
        }
    });
}
