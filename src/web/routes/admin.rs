//! Admin HTTP surface under `/api/admin/*`, gated by the admin middleware.
//! The richer management surface lives on the RPC dispatcher; these routes
//! cover the operations the dashboard needs directly.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use serde_json::json;

use crate::db::services::{accounts, clients, ping};
use crate::server::AppState;
use crate::web::error::AppError;
use crate::web::response::envelope_success;

/// `GET /api/admin/clients`
pub async fn list_clients(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let rows = clients::list_all(&state.db).await?;
    let view: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|c| {
            let mut v = serde_json::to_value(&c).unwrap_or_else(|_| json!({}));
            if let Some(map) = v.as_object_mut() {
                map.insert("token".into(), json!(c.token));
                map.insert("remark".into(), json!(c.remark));
                map.insert("online".into(), json!(state.agents.is_online(&c.uuid)));
            }
            v
        })
        .collect();
    Ok(envelope_success(view))
}

/// `POST /api/admin/clients`
pub async fn create_client(
    State(state): State<Arc<AppState>>,
    body: Option<axum::Json<serde_json::Value>>,
) -> Result<Response, AppError> {
    let name = body
        .and_then(|b| b.0.get("name").and_then(|v| v.as_str()).map(str::to_owned));
    let (uuid, token) = clients::create_client(&state.db, &state.bus, name).await?;
    Ok(envelope_success(json!({ "uuid": uuid, "token": token })))
}

/// `POST /api/admin/client/{uuid}`
pub async fn update_client(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    body: axum::Json<clients::ClientPatch>,
) -> Result<Response, AppError> {
    let updated = clients::update_client(&state.db, &state.bus, &uuid, body.0).await?;
    Ok(envelope_success(updated))
}

/// `DELETE /api/admin/client/{uuid}`
pub async fn delete_client(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<Response, AppError> {
    clients::delete_client(&state.db, &state.bus, &uuid).await?;
    Ok(envelope_success(json!("ok")))
}

/// `GET /api/admin/settings`
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    Ok(envelope_success(state.config.get().as_ref().clone()))
}

/// `POST /api/admin/settings`: deep-merged partial update.
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    body: axum::Json<serde_json::Value>,
) -> Result<Response, AppError> {
    state
        .config
        .save_partial(body.0)
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    Ok(envelope_success(json!("ok")))
}

/// `GET /api/admin/sessions`
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    Ok(envelope_success(
        accounts::list_all_sessions(&state.db).await?,
    ))
}

/// `POST /api/admin/session/{token}/revoke`
pub async fn revoke_session(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    accounts::delete_session(&state.db, &token).await?;
    Ok(envelope_success(json!("ok")))
}

/// `GET /api/admin/ping_tasks`
pub async fn list_ping_tasks(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    Ok(envelope_success(ping::get_all_tasks(&state.db).await?))
}
