//! HTTP boundary: the `/api` router, the response envelope and the auth
//! gates.

pub mod error;
pub mod middleware;
pub mod response;
pub mod routes;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::server::{agent, terminal, AppState};
use middleware::auth::{admin_guard, private_site_gate};

pub fn build_router(state: Arc<AppState>) -> Router {
    // Public data paths behind the private-site gate. Login, identity and
    // site info stay reachable so an operator can still get in.
    let gated_public = Router::new()
        .route("/api/clients", get(routes::public::list_clients))
        .route("/api/nodes", get(routes::public::list_nodes))
        .route("/api/recent/{uuid}", get(routes::public::recent))
        .route("/api/records/load", get(routes::public::records_load))
        .route("/api/records/ping", get(routes::public::records_ping))
        .route("/api/task/ping", get(routes::public::ping_tasks))
        .layer(from_fn_with_state(state.clone(), private_site_gate));

    let open = Router::new()
        .route("/api/public", get(routes::public::site_info))
        .route("/api/version", get(routes::public::version))
        .route("/api/login", post(routes::auth::login))
        .route("/api/logout", get(routes::auth::logout))
        .route("/api/me", get(routes::auth::me))
        .route("/api/oauth", get(routes::auth::oauth))
        .route("/api/oauth_callback", get(routes::auth::oauth_callback));

    let agent_routes = Router::new()
        .route("/api/clients/register", post(routes::agent::register))
        .route(
            "/api/clients/report",
            get(agent::report_ws_handler).post(routes::agent::report_once),
        )
        .route(
            "/api/clients/uploadBasicInfo",
            post(routes::agent::upload_basic_info),
        )
        .route(
            "/api/clients/terminal",
            get(terminal::agent_terminal_handler),
        )
        .route("/api/clients/task/result", post(routes::agent::task_result));

    let admin = Router::new()
        .route(
            "/api/admin/clients",
            get(routes::admin::list_clients).post(routes::admin::create_client),
        )
        .route(
            "/api/admin/client/{uuid}",
            post(routes::admin::update_client).delete(routes::admin::delete_client),
        )
        .route(
            "/api/admin/client/{uuid}/terminal",
            get(terminal::operator_terminal_handler),
        )
        .route(
            "/api/admin/settings",
            get(routes::admin::get_settings).post(routes::admin::update_settings),
        )
        .route("/api/admin/sessions", get(routes::admin::list_sessions))
        .route(
            "/api/admin/session/{token}/revoke",
            delete(routes::admin::revoke_session).post(routes::admin::revoke_session),
        )
        .route("/api/admin/ping_tasks", get(routes::admin::list_ping_tasks))
        .layer(from_fn_with_state(state.clone(), admin_guard));

    let rpc = Router::new().route(
        "/api/rpc2",
        get(routes::rpc::rpc_ws).post(routes::rpc::rpc_http),
    );

    Router::new()
        .merge(gated_public)
        .merge(open)
        .merge(agent_routes)
        .merge(admin)
        .merge(rpc)
        .with_state(state)
}
