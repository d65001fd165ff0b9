//! Public data endpoints. Everything here is reachable by guests unless
//! private-site mode gates it; hidden clients never appear in a guest view.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::db::services::{clients, ping, records};
use crate::rpc::Permission;
use crate::server::AppState;
use crate::version::VERSION;
use crate::web::error::AppError;
use crate::web::middleware::auth::resolve_principal;
use crate::web::response::envelope_success;

async fn caller_is_privileged(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    jar: &CookieJar,
) -> bool {
    let principal = resolve_principal(state, headers, jar, None).await;
    principal.permission == Permission::Admin
}

/// `GET /api/version`
pub async fn version() -> Response {
    envelope_success(json!({ "version": VERSION }))
}

/// `GET /api/public`
pub async fn site_info(State(state): State<Arc<AppState>>) -> Response {
    let config = state.config.get();
    envelope_success(json!({
        "sitename": config.site.sitename,
        "description": config.site.description,
        "theme": config.site.theme,
        "private_site": config.site.private_site,
        "version": VERSION,
    }))
}

/// `GET /api/clients`: display metadata of visible clients, heaviest first.
pub async fn list_clients(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    let rows = if caller_is_privileged(&state, &headers, &jar).await {
        clients::list_all(&state.db).await?
    } else {
        clients::list_public(&state.db).await?
    };
    Ok(envelope_success(rows))
}

/// `GET /api/nodes`: visible clients with live status and the newest report.
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    let privileged = caller_is_privileged(&state, &headers, &jar).await;
    let rows = if privileged {
        clients::list_all(&state.db).await?
    } else {
        clients::list_public(&state.db).await?
    };
    let nodes: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|c| {
            let latest = state.latest.latest(&c.uuid);
            let online = state.agents.is_online(&c.uuid) || latest.is_some();
            json!({
                "client": c,
                "online": online,
                "report": latest,
            })
        })
        .collect();
    Ok(envelope_success(nodes))
}

async fn reject_hidden_for_guests(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    jar: &CookieJar,
    uuid: &str,
) -> Result<bool, AppError> {
    if caller_is_privileged(state, headers, jar).await {
        return Ok(false);
    }
    let visible = clients::get_by_uuid(&state.db, uuid)
        .await?
        .map(|c| !c.hidden)
        .unwrap_or(false);
    Ok(!visible)
}

/// `GET /api/recent/{uuid}`: the live report window.
pub async fn recent(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    if reject_hidden_for_guests(&state, &headers, &jar, &uuid).await? {
        return Err(AppError::InvalidInput("UUID is required".into()));
    }
    let window = state.latest.window(&uuid);
    Ok(envelope_success(json!({
        "count": window.len(),
        "records": window,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LoadQuery {
    pub uuid: String,
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    4
}

/// `GET /api/records/load?uuid&hours`
pub async fn records_load(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoadQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    if query.uuid.is_empty() {
        return Err(AppError::InvalidInput("UUID is required".into()));
    }
    if reject_hidden_for_guests(&state, &headers, &jar, &query.uuid).await? {
        return Err(AppError::InvalidInput("UUID is required".into()));
    }
    let end = Utc::now();
    let rows = records::get_by_client_and_range(
        &state.db,
        &query.uuid,
        end - Duration::hours(query.hours.max(1)),
        end,
    )
    .await?;
    Ok(envelope_success(json!({
        "count": rows.len(),
        "records": rows,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PingQuery {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default = "default_hours")]
    pub hours: i64,
}

/// `GET /api/records/ping?uuid|task_id&hours`: observations plus per-client
/// aggregates and task summaries.
pub async fn records_ping(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PingQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    if query.uuid.is_none() && query.task_id.is_none() {
        return Err(AppError::InvalidInput("UUID or task_id is required".into()));
    }
    let privileged = caller_is_privileged(&state, &headers, &jar).await;
    if let Some(uuid) = &query.uuid {
        if !privileged {
            let visible = clients::get_by_uuid(&state.db, uuid)
                .await?
                .map(|c| !c.hidden)
                .unwrap_or(false);
            if !visible {
                // Hidden targets answer with an empty result set.
                return Ok(envelope_success(json!({
                    "count": 0,
                    "records": [],
                })));
            }
        }
    }

    let end = Utc::now();
    let mut rows = ping::get_records(
        &state.db,
        query.uuid.as_deref(),
        query.task_id,
        end - Duration::hours(query.hours.max(1)),
        end,
    )
    .await?;
    if !privileged {
        let hidden = clients::hidden_uuids(&state.db).await?;
        rows.retain(|r| !hidden.contains(&r.client));
    }

    let stats = ping::aggregate_stats(&rows);
    let tasks = ping::get_all_tasks(&state.db).await?;
    let task_views: Vec<serde_json::Value> = tasks
        .iter()
        .filter(|t| query.task_id.map(|id| t.id == id).unwrap_or(true))
        .filter(|t| {
            query
                .uuid
                .as_ref()
                .map(|uuid| t.clients.0.iter().any(|c| c == uuid))
                .unwrap_or(true)
        })
        .map(|t| {
            let task_rows: Vec<_> = rows.iter().filter(|r| r.task_id == t.id).cloned().collect();
            let task_stats = ping::aggregate_stats(&task_rows);
            let loss = if task_rows.is_empty() {
                0.0
            } else {
                task_rows.iter().filter(|r| r.value < 0).count() as f64 / task_rows.len() as f64
                    * 100.0
            };
            json!({
                "id": t.id,
                "name": t.name,
                "type": t.kind,
                "interval": t.interval,
                "loss": loss,
                "total": task_rows.len(),
                "clients_stats": task_stats,
            })
        })
        .collect();

    Ok(envelope_success(json!({
        "count": rows.len(),
        "basic_info": stats,
        "records": rows,
        "tasks": task_views,
    })))
}

/// `GET /api/task/ping`: the configured probes, without targets or member
/// lists for guests.
pub async fn ping_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    let privileged = caller_is_privileged(&state, &headers, &jar).await;
    let tasks = ping::get_all_tasks(&state.db).await?;
    let view: Vec<serde_json::Value> = tasks
        .iter()
        .map(|t| {
            if privileged {
                json!(t)
            } else {
                json!({
                    "id": t.id,
                    "name": t.name,
                    "type": t.kind,
                    "interval": t.interval,
                })
            }
        })
        .collect();
    Ok(envelope_success(view))
}
