//! Agent-facing HTTP endpoints: auto-discovery registration and the
//! one-shot fallbacks to the persistent channel.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use chrono::Utc;
use serde_json::json;

use crate::db::entities::client;
use crate::db::services::{clients, tasks};
use crate::server::agent::{bearer_token, AgentQuery};
use crate::server::frames::{BasicInfo, Report};
use crate::server::AppState;
use crate::utils::{random_string, secure_compare};
use crate::web::error::AppError;
use crate::web::middleware::auth::MIN_KEY_LENGTH;
use crate::web::response::{envelope_error, envelope_success};

/// `POST /api/clients/register`: auto-discovery. The bearer key must match
/// the configured `auto_discovery_key`, which must be at least 12 chars; an
/// empty key disables the endpoint entirely.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let configured = state.config.get().login.auto_discovery_key.clone();
    let presented = bearer_token(&headers).unwrap_or_default();
    if configured.is_empty()
        || configured.len() < MIN_KEY_LENGTH
        || !secure_compare(&presented, &configured)
    {
        return Ok(envelope_error(
            StatusCode::FORBIDDEN,
            "Invalid AutoDiscovery Key",
        ));
    }

    let slug = match query.get("name") {
        Some(name) if !name.is_empty() => name.clone(),
        _ => random_string(8),
    };
    let name = format!("Auto-{slug}");
    let (uuid, token) = clients::create_client(&state.db, &state.bus, Some(name)).await?;
    Ok(envelope_success(json!({ "uuid": uuid, "token": token })))
}

async fn authenticated_client(
    state: &Arc<AppState>,
    query: &AgentQuery,
    headers: &HeaderMap,
) -> Result<client::Model, AppError> {
    let token = query
        .token
        .clone()
        .or_else(|| bearer_token(headers))
        .unwrap_or_default();
    clients::find_by_token(&state.db, &token)
        .await?
        .ok_or(AppError::Unauthorized)
}

/// `POST /api/clients/report`: one-shot report submission for agents that
/// cannot hold the persistent channel open.
pub async fn report_once(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
    headers: HeaderMap,
    body: axum::Json<Report>,
) -> Result<Response, AppError> {
    let client = authenticated_client(&state, &query, &headers).await?;
    let mut report = body.0;
    report.updated_at = Utc::now();
    state.latest.push(&client.uuid, report);
    Ok(envelope_success(json!("ok")))
}

/// `POST /api/clients/uploadBasicInfo`
pub async fn upload_basic_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
    headers: HeaderMap,
    body: axum::Json<BasicInfo>,
) -> Result<Response, AppError> {
    let client = authenticated_client(&state, &query, &headers).await?;
    clients::update_basic_info(&state.db, &client.uuid, body.0).await?;
    Ok(envelope_success(json!("ok")))
}

#[derive(Debug, serde::Deserialize)]
pub struct TaskResultBody {
    pub task_id: String,
    pub result: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

/// `POST /api/clients/task/result`
pub async fn task_result(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
    headers: HeaderMap,
    body: axum::Json<TaskResultBody>,
) -> Result<Response, AppError> {
    let client = authenticated_client(&state, &query, &headers).await?;
    let stored = tasks::insert_result_if_absent(
        &state.db,
        &body.task_id,
        &client.uuid,
        &body.result,
        body.exit_code,
        body.finished_at,
    )
    .await?;
    Ok(envelope_success(json!({ "stored": stored })))
}
