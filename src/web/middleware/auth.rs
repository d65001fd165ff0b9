//! Caller resolution and route gates.
//!
//! Permission precedence, highest first: a valid API key header, an admin
//! session cookie, an agent token, then guest. The private-site gate sits on
//! the public data routes only; the admin gate covers `/api/admin/*`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;

use crate::db::services::{accounts, clients};
use crate::rpc::Permission;
use crate::server::AppState;
use crate::utils::secure_compare;
use crate::web::response::envelope_error;

/// Minimum length for the global API key (and the auto-discovery key) to be
/// considered configured at all.
pub const MIN_KEY_LENGTH: usize = 12;

#[derive(Debug, Clone)]
pub struct Principal {
    pub permission: Permission,
    pub client_uuid: Option<String>,
    pub user_uuid: Option<String>,
    pub session_token: Option<String>,
}

impl Principal {
    pub fn guest() -> Self {
        Self {
            permission: Permission::Guest,
            client_uuid: None,
            user_uuid: None,
            session_token: None,
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub fn api_key_valid(state: &AppState, headers: &HeaderMap) -> bool {
    let config = state.config.get();
    let configured = &config.login.api_key;
    if configured.len() < MIN_KEY_LENGTH {
        return false;
    }
    bearer(headers).is_some_and(|presented| secure_compare(presented, configured))
}

/// Resolve the caller for a request. `query_token` is the agent `?token=`
/// parameter when the route carries one.
pub async fn resolve_principal(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    jar: &CookieJar,
    query_token: Option<&str>,
) -> Principal {
    if api_key_valid(state, headers) {
        return Principal {
            permission: Permission::Admin,
            client_uuid: None,
            user_uuid: None,
            session_token: None,
        };
    }

    if let Some(cookie) = jar.get("session_token") {
        if let Ok(Some(session)) = accounts::get_session(&state.db, cookie.value()).await {
            return Principal {
                permission: Permission::Admin,
                client_uuid: None,
                user_uuid: Some(session.uuid),
                session_token: Some(session.token),
            };
        }
    }

    let token = query_token.map(str::to_owned).or_else(|| bearer(headers).map(str::to_owned));
    if let Some(token) = token {
        if let Ok(Some(client)) = clients::find_by_token(&state.db, &token).await {
            return Principal {
                permission: Permission::Client,
                client_uuid: Some(client.uuid),
                user_uuid: None,
                session_token: None,
            };
        }
    }

    Principal::guest()
}

/// Gate for `/api/admin/*`: session or bearer key, nothing else.
pub async fn admin_guard(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let principal = resolve_principal(&state, request.headers(), &jar, None).await;
    if principal.permission != Permission::Admin {
        return envelope_error(StatusCode::UNAUTHORIZED, "Unauthorized.");
    }
    if let Some(token) = &principal.session_token {
        let user_agent = request
            .headers()
            .get("User-Agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let ip = remote_ip(request.headers());
        let _ = accounts::touch_session(&state.db, token, &user_agent, &ip).await;
    }
    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Gate for the public data allowlist when private-site mode is on: any
/// admin credential passes, everyone else gets a uniform 401 whether or not
/// the resource exists.
pub async fn private_site_gate(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.get().site.private_site {
        return next.run(request).await;
    }
    let principal = resolve_principal(
        &state,
        request.headers(),
        &jar,
        query.get("token").map(String::as_str),
    )
    .await;
    if matches!(principal.permission, Permission::Admin | Permission::Client) {
        return next.run(request).await;
    }
    envelope_error(
        StatusCode::UNAUTHORIZED,
        "Private site is enabled, please login first.",
    )
}

/// Best-effort source address: the first forwarded hop, else unknown.
pub fn remote_ip(headers: &HeaderMap) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .or_else(|| {
            headers
                .get("X-Real-IP")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
        .unwrap_or_default()
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get("User-Agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned()
}

