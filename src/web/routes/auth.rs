//! Login, logout and the caller-identity endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use serde_json::json;

use crate::db::services::{accounts, audit};
use crate::event::Event;
use crate::rpc::Permission;
use crate::server::AppState;
use crate::web::error::AppError;
use crate::web::middleware::auth::{remote_ip, resolve_principal, user_agent};
use crate::web::response::{envelope_error, envelope_success};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default, rename = "2fa_code")]
    pub two_fa_code: String,
}

/// `POST /api/login`. Failures are audited with the submitted username and
/// source address but answered with one generic message.
pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    body: axum::Json<LoginRequest>,
) -> Result<Response, AppError> {
    let config = state.config.get();
    if config.login.disable_password_login {
        return Ok(envelope_error(
            StatusCode::FORBIDDEN,
            "Password login is disabled",
        ));
    }
    let request = body.0;
    if request.username.is_empty() || request.password.is_empty() {
        return Err(AppError::InvalidInput(
            "Username and password are required".into(),
        ));
    }

    let ip = remote_ip(&headers);
    let ua = user_agent(&headers);

    let Some(uuid) =
        accounts::check_password(&state.db, &request.username, &request.password).await?
    else {
        state.bus.trigger_async(Event::LoginFailed {
            username: request.username,
            method: "password".into(),
            ip,
            user_agent: ua,
        });
        return Ok(envelope_error(StatusCode::UNAUTHORIZED, "Invalid credentials"));
    };

    let user = accounts::get_user_by_uuid(&state.db, &uuid)
        .await?
        .ok_or_else(|| AppError::Internal("user vanished mid-login".into()))?;
    if !user.two_factor.is_empty() {
        if request.two_fa_code.is_empty() {
            return Ok(envelope_error(StatusCode::UNAUTHORIZED, "2FA code is required"));
        }
        if !accounts::verify_two_factor(&state.db, &uuid, &request.two_fa_code).await? {
            state.bus.trigger_async(Event::LoginFailed {
                username: request.username,
                method: "2fa".into(),
                ip,
                user_agent: ua,
            });
            return Ok(envelope_error(StatusCode::UNAUTHORIZED, "Invalid 2FA code"));
        }
    }

    let token = accounts::create_session(
        &state.db,
        &uuid,
        accounts::SESSION_TTL_SECONDS,
        &ua,
        &ip,
        "password",
    )
    .await?;
    audit::log(&state.db, &ip, &uuid, "logged in (password)", "login").await;
    state.bus.trigger_async(Event::LoginSucceeded {
        username: request.username,
        method: "password".into(),
        ip,
        user_agent: ua,
    });

    let cookie = Cookie::build(("session_token", token.clone()))
        .path("/")
        .http_only(true)
        .max_age(time::Duration::seconds(accounts::SESSION_TTL_SECONDS))
        .build();
    let jar = jar.add(cookie);
    Ok((
        jar,
        envelope_success(json!({ "set-cookie": { "session_token": token } })),
    )
        .into_response())
}

/// `GET /api/logout`
pub async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    if let Some(cookie) = jar.get("session_token") {
        let _ = accounts::delete_session(&state.db, cookie.value()).await;
    }
    let ip = remote_ip(&headers);
    audit::log(&state.db, &ip, "", "logged out", "logout").await;
    state.bus.trigger_async(Event::UserLogout { ip });

    let jar = jar.remove(Cookie::build(("session_token", "")).path("/").build());
    (jar, Redirect::to("/")).into_response()
}

/// `GET /api/oauth`: hand the caller to the configured identity provider.
/// The exchange itself lives outside the core; this endpoint only contracts
/// the entry point.
pub async fn oauth(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let providers = crate::db::services::oidc::list(&state.db).await?;
    let Some(provider) = providers.into_iter().find(|p| p.enabled) else {
        return Ok(envelope_error(
            StatusCode::NOT_FOUND,
            "No external identity provider is configured",
        ));
    };
    let url = format!(
        "{}?client_id={}&response_type=code&scope={}",
        provider.authorize_url, provider.client_id, provider.scopes
    );
    Ok(Redirect::to(&url).into_response())
}

/// `GET /api/oauth_callback`. Binding requires an existing login; an
/// unknown external identity is told to log in and bind first, never
/// auto-provisioned.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let principal = resolve_principal(&state, &headers, &jar, None).await;
    if principal.user_uuid.is_none() {
        return Ok(envelope_error(
            StatusCode::UNAUTHORIZED,
            "Please log in and bind your external account first",
        ));
    }
    // The token exchange is delegated to the external OAuth collaborator;
    // without it there is nothing to bind here.
    Ok(envelope_error(
        StatusCode::NOT_FOUND,
        "No external identity provider is configured",
    ))
}

/// `GET /api/me`
pub async fn me(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let principal = resolve_principal(&state, &headers, &jar, None).await;
    match &principal.user_uuid {
        Some(uuid) => {
            let user = accounts::get_user_by_uuid(&state.db, uuid)
                .await?
                .ok_or(AppError::Unauthorized)?;
            Ok(envelope_success(json!({
                "logged_in": true,
                "uuid": user.uuid,
                "username": user.username,
                "2fa_enabled": !user.two_factor.is_empty(),
                "sso_type": user.sso_type,
            })))
        }
        None => Ok(envelope_success(json!({
            "logged_in": principal.permission == Permission::Admin,
        }))),
    }
}
