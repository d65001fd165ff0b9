//! The registered RPC surface.
//!
//! Populated once from `main` so the available methods are visible in one
//! place. Handlers stay thin: parameter parsing, a permission-sensitive
//! view decision, then a service call.

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_params, Permission, RpcContext, RpcError, RpcRegistry};
use crate::db::services::{
    accounts, alert_rules, audit, clients, clipboard, oidc, ping, records, tasks,
};
use crate::notifications::AlertEvent;
use crate::server::frames::{BasicInfo, PingKind, ServerFrame};
use crate::version::VERSION;

async fn ensure_visible(ctx: &RpcContext, uuid: &str) -> Result<(), RpcError> {
    if ctx.permission != Permission::Guest {
        return Ok(());
    }
    let visible = clients::get_by_uuid(&ctx.state.db, uuid)
        .await
        .map_err(RpcError::from)?
        .map(|c| !c.hidden)
        .unwrap_or(false);
    if visible {
        Ok(())
    } else {
        // Hidden and unknown clients answer identically.
        Err(RpcError::invalid_params("unknown client"))
    }
}

fn client_view(ctx: &RpcContext, client: &crate::db::entities::client::Model) -> Value {
    let mut view = serde_json::to_value(client).unwrap_or_else(|_| json!({}));
    if let Some(map) = view.as_object_mut() {
        if ctx.permission == Permission::Admin {
            map.insert("token".into(), json!(client.token));
            map.insert("remark".into(), json!(client.remark));
        }
        map.insert(
            "online".into(),
            json!(
                ctx.state.agents.is_online(&client.uuid)
                    || ctx.state.latest.latest(&client.uuid).is_some()
            ),
        );
    }
    view
}

pub fn register_all(registry: &RpcRegistry) {
    // --- rpc ---

    registry.register("rpc:methods", "List registered methods", |ctx, _| async move {
        let listed: Vec<Value> = ctx
            .state
            .rpc
            .list()
            .into_iter()
            .map(|(method, summary)| json!({"method": method, "summary": summary}))
            .collect();
        Ok(json!(listed))
    });

    // --- common ---

    registry.register("common:ping", "Liveness probe", |_, _| async move {
        Ok(json!("pong"))
    });

    registry.register("common:version", "Server version", |_, _| async move {
        Ok(json!({ "version": VERSION }))
    });

    registry.register(
        "common:getPublicInfo",
        "Public site information",
        |ctx, _| async move {
            let config = ctx.state.config.get();
            Ok(json!({
                "sitename": config.site.sitename,
                "description": config.site.description,
                "theme": config.site.theme,
                "private_site": config.site.private_site,
                "version": VERSION,
            }))
        },
    );

    registry.register(
        "common:getNodes",
        "Visible clients with live status",
        |ctx, _| async move {
            let rows = if ctx.permission == Permission::Admin {
                clients::list_all(&ctx.state.db).await?
            } else {
                clients::list_public(&ctx.state.db).await?
            };
            let nodes: Vec<Value> = rows.iter().map(|c| client_view(&ctx, c)).collect();
            Ok(json!(nodes))
        },
    );

    registry.register(
        "common:getRecent",
        "Live report window for one client",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                uuid: String,
            }
            let p: Params = parse_params(params)?;
            ensure_visible(&ctx, &p.uuid).await?;
            let window = ctx.state.latest.window(&p.uuid);
            Ok(json!({ "count": window.len(), "records": window }))
        },
    );

    registry.register(
        "common:getRecords",
        "Minute records for one client",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                uuid: String,
                #[serde(default = "default_hours")]
                hours: i64,
            }
            let p: Params = parse_params(params)?;
            ensure_visible(&ctx, &p.uuid).await?;
            let end = Utc::now();
            let rows = records::get_by_client_and_range(
                &ctx.state.db,
                &p.uuid,
                end - Duration::hours(p.hours.max(1)),
                end,
            )
            .await?;
            Ok(json!({ "count": rows.len(), "records": rows }))
        },
    );

    registry.register(
        "common:getPingRecords",
        "Probe observations by client and/or task",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                #[serde(default)]
                uuid: Option<String>,
                #[serde(default)]
                task_id: Option<i64>,
                #[serde(default = "default_hours")]
                hours: i64,
            }
            let p: Params = parse_params(params)?;
            if p.uuid.is_none() && p.task_id.is_none() {
                return Err(RpcError::invalid_params("uuid or task_id is required"));
            }
            if let Some(uuid) = &p.uuid {
                ensure_visible(&ctx, uuid).await?;
            }

            let end = Utc::now();
            let mut rows = ping::get_records(
                &ctx.state.db,
                p.uuid.as_deref(),
                p.task_id,
                end - Duration::hours(p.hours.max(1)),
                end,
            )
            .await?;

            if ctx.permission == Permission::Guest {
                let hidden = clients::hidden_uuids(&ctx.state.db).await?;
                rows.retain(|r| !hidden.contains(&r.client));
            }
            let stats = ping::aggregate_stats(&rows);
            Ok(json!({ "count": rows.len(), "basic_info": stats, "records": rows }))
        },
    );

    registry.register(
        "common:getPingTasks",
        "Configured ping tasks",
        |ctx, _| async move {
            let rows = ping::get_all_tasks(&ctx.state.db).await?;
            let view: Vec<Value> = rows
                .iter()
                .map(|t| {
                    if ctx.permission == Permission::Admin {
                        serde_json::to_value(t).unwrap_or(Value::Null)
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
            Ok(json!(view))
        },
    );

    registry.register("common:getMe", "Caller identity", |ctx, _| async move {
        match &ctx.user_uuid {
            Some(uuid) => {
                let user = accounts::get_user_by_uuid(&ctx.state.db, uuid)
                    .await?
                    .ok_or_else(|| RpcError::internal("session user vanished"))?;
                Ok(json!({
                    "logged_in": true,
                    "uuid": user.uuid,
                    "username": user.username,
                    "2fa_enabled": !user.two_factor.is_empty(),
                    "sso_type": user.sso_type,
                }))
            }
            None => Ok(json!({ "logged_in": ctx.permission == Permission::Admin })),
        }
    });

    // --- client ---

    registry.register(
        "client:uploadBasicInfo",
        "Agent host metadata upload",
        |ctx, params| async move {
            let uuid = ctx
                .client_uuid
                .clone()
                .ok_or_else(|| RpcError::new(super::UNAUTHENTICATED, "agent token required"))?;
            let info: BasicInfo = parse_params(params)?;
            clients::update_basic_info(&ctx.state.db, &uuid, info).await?;
            Ok(json!("ok"))
        },
    );

    registry.register(
        "client:submitTaskResult",
        "Agent task result upload",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                task_id: String,
                result: String,
                #[serde(default)]
                exit_code: Option<i32>,
                #[serde(default)]
                finished_at: Option<chrono::DateTime<Utc>>,
            }
            let uuid = ctx
                .client_uuid
                .clone()
                .ok_or_else(|| RpcError::new(super::UNAUTHENTICATED, "agent token required"))?;
            let p: Params = parse_params(params)?;
            let inserted = tasks::insert_result_if_absent(
                &ctx.state.db,
                &p.task_id,
                &uuid,
                &p.result,
                p.exit_code,
                p.finished_at,
            )
            .await?;
            Ok(json!({ "stored": inserted }))
        },
    );

    // --- admin: clients ---

    registry.register("admin:listClients", "All clients", |ctx, _| async move {
        let rows = clients::list_all(&ctx.state.db).await?;
        let view: Vec<Value> = rows.iter().map(|c| client_view(&ctx, c)).collect();
        Ok(json!(view))
    });

    registry.register(
        "admin:createClient",
        "Create a client",
        |ctx, params| async move {
            #[derive(Deserialize, Default)]
            #[serde(default)]
            struct Params {
                name: Option<String>,
            }
            let p: Params = parse_params(params)?;
            let (uuid, token) = clients::create_client(&ctx.state.db, &ctx.state.bus, p.name)
                .await
                .map_err(RpcError::from)?;
            Ok(json!({ "uuid": uuid, "token": token }))
        },
    );

    registry.register(
        "admin:updateClient",
        "Update client metadata",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                uuid: String,
                #[serde(flatten)]
                patch: clients::ClientPatch,
            }
            let p: Params = parse_params(params)?;
            let updated =
                clients::update_client(&ctx.state.db, &ctx.state.bus, &p.uuid, p.patch).await?;
            Ok(client_view(&ctx, &updated))
        },
    );

    registry.register(
        "admin:deleteClient",
        "Delete a client and everything it owns",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                uuid: String,
            }
            let p: Params = parse_params(params)?;
            clients::delete_client(&ctx.state.db, &ctx.state.bus, &p.uuid).await?;
            audit::log(
                &ctx.state.db,
                &ctx.remote_ip,
                ctx.user_uuid.as_deref().unwrap_or(""),
                &format!("deleted client {}", p.uuid),
                "admin",
            )
            .await;
            Ok(json!("ok"))
        },
    );

    // --- admin: ping tasks ---

    registry.register("admin:listPingTasks", "All ping tasks", |ctx, _| async move {
        let rows = ping::get_all_tasks(&ctx.state.db).await?;
        Ok(serde_json::to_value(rows).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:addPingTask",
        "Create a ping task",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                name: String,
                clients: Vec<String>,
                #[serde(rename = "type")]
                kind: PingKind,
                target: String,
                interval: i64,
            }
            let p: Params = parse_params(params)?;
            let id = ping::add_task(
                &ctx.state.db,
                &p.name,
                p.clients,
                p.kind,
                &p.target,
                p.interval,
            )
            .await?;
            reload_ping(&ctx).await;
            Ok(json!({ "id": id }))
        },
    );

    registry.register(
        "admin:editPingTask",
        "Edit a ping task",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                id: i64,
                #[serde(flatten)]
                patch: ping::PingTaskPatch,
            }
            let p: Params = parse_params(params)?;
            let updated = ping::edit_task(&ctx.state.db, p.id, p.patch).await?;
            reload_ping(&ctx).await;
            Ok(serde_json::to_value(updated).map_err(RpcError::internal)?)
        },
    );

    registry.register(
        "admin:deletePingTask",
        "Delete ping tasks",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                ids: Vec<i64>,
            }
            let p: Params = parse_params(params)?;
            let deleted = ping::delete_tasks(&ctx.state.db, &p.ids).await?;
            reload_ping(&ctx).await;
            Ok(json!({ "deleted": deleted }))
        },
    );

    // --- admin: ad-hoc tasks ---

    registry.register(
        "admin:execCommand",
        "Run a command on a set of agents",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                clients: Vec<String>,
                command: String,
            }
            let p: Params = parse_params(params)?;
            let task_id = tasks::create_task(&ctx.state.db, p.clients.clone(), &p.command).await?;

            let mut dispatched = 0usize;
            for uuid in &p.clients {
                if let Some(handle) = ctx.state.agents.get(uuid) {
                    let frame = ServerFrame::ExecTask {
                        task_id: task_id.clone(),
                        command: p.command.clone(),
                    };
                    if handle.send(&frame).await.is_ok() {
                        dispatched += 1;
                    }
                }
            }
            audit::log(
                &ctx.state.db,
                &ctx.remote_ip,
                ctx.user_uuid.as_deref().unwrap_or(""),
                &format!("dispatched command task {task_id}"),
                "admin",
            )
            .await;
            Ok(json!({
                "task_id": task_id,
                "dispatched": dispatched,
                "offline": p.clients.len() - dispatched,
            }))
        },
    );

    registry.register(
        "admin:getTaskResults",
        "Results of an ad-hoc task",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                task_id: String,
            }
            let p: Params = parse_params(params)?;
            let task = tasks::get_task(&ctx.state.db, &p.task_id)
                .await?
                .ok_or_else(|| RpcError::invalid_params("unknown task"))?;
            let results = tasks::get_results(&ctx.state.db, &p.task_id).await?;
            let finished = tasks::is_terminal(&ctx.state.db, &task).await?;
            Ok(json!({ "task": task, "results": results, "finished": finished }))
        },
    );

    // --- admin: sessions & 2FA ---

    registry.register("admin:listSessions", "Active web sessions", |ctx, _| async move {
        let sessions = match &ctx.user_uuid {
            Some(uuid) => accounts::list_sessions(&ctx.state.db, uuid).await?,
            None => accounts::list_all_sessions(&ctx.state.db).await?,
        };
        Ok(serde_json::to_value(sessions).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:revokeSession",
        "Revoke one session",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                token: String,
            }
            let p: Params = parse_params(params)?;
            accounts::delete_session(&ctx.state.db, &p.token).await?;
            Ok(json!("ok"))
        },
    );

    registry.register(
        "admin:revokeAllSessions",
        "Revoke every session",
        |ctx, _| async move {
            let revoked = accounts::delete_all_sessions(&ctx.state.db).await?;
            Ok(json!({ "revoked": revoked }))
        },
    );

    registry.register(
        "admin:generate2fa",
        "Start 2FA enrollment",
        |ctx, _| async move {
            let uuid = session_user(&ctx)?;
            let user = accounts::get_user_by_uuid(&ctx.state.db, &uuid)
                .await?
                .ok_or_else(|| RpcError::internal("session user vanished"))?;
            let (secret, url) = accounts::generate_two_factor(&user.username)?;
            Ok(json!({ "secret": secret, "url": url }))
        },
    );

    registry.register(
        "admin:enable2fa",
        "Finish 2FA enrollment",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                secret: String,
                code: String,
            }
            let uuid = session_user(&ctx)?;
            let p: Params = parse_params(params)?;
            accounts::enable_two_factor(&ctx.state.db, &uuid, &p.secret).await?;
            if !accounts::verify_two_factor(&ctx.state.db, &uuid, &p.code).await? {
                accounts::disable_two_factor(&ctx.state.db, &uuid).await?;
                return Err(RpcError::invalid_params("2FA code did not verify"));
            }
            Ok(json!("ok"))
        },
    );

    registry.register("admin:disable2fa", "Disable 2FA", |ctx, _| async move {
        let uuid = session_user(&ctx)?;
        accounts::disable_two_factor(&ctx.state.db, &uuid).await?;
        Ok(json!("ok"))
    });

    registry.register(
        "admin:unbindExternalAccount",
        "Clear the SSO binding",
        |ctx, _| async move {
            let uuid = session_user(&ctx)?;
            accounts::unbind_sso(&ctx.state.db, &uuid).await?;
            Ok(json!("ok"))
        },
    );

    // --- admin: settings ---

    registry.register("admin:getSettings", "Current configuration", |ctx, _| async move {
        Ok(serde_json::to_value(ctx.state.config.get().as_ref()).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:updateSettings",
        "Deep-merge a configuration patch",
        |ctx, params| async move {
            let patch = params.ok_or_else(|| RpcError::invalid_params("patch required"))?;
            ctx.state
                .config
                .save_partial(patch)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;
            Ok(json!("ok"))
        },
    );

    // --- admin: alert rules ---

    registry.register("admin:listOfflineRules", "Offline alert rules", |ctx, _| async move {
        let rows = alert_rules::list_offline_rules(&ctx.state.db).await?;
        Ok(serde_json::to_value(rows).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:upsertOfflineRule",
        "Create or update an offline rule",
        |ctx, params| async move {
            let rule: alert_rules::OfflineRuleUpsert = parse_params(params)?;
            alert_rules::upsert_offline_rule(&ctx.state.db, rule).await?;
            Ok(json!("ok"))
        },
    );

    registry.register(
        "admin:deleteOfflineRule",
        "Delete an offline rule",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                client: String,
            }
            let p: Params = parse_params(params)?;
            alert_rules::delete_offline_rule(&ctx.state.db, &p.client).await?;
            Ok(json!("ok"))
        },
    );

    registry.register("admin:listLoadRules", "Sustained-load rules", |ctx, _| async move {
        let rows = alert_rules::list_load_rules(&ctx.state.db).await?;
        Ok(serde_json::to_value(rows).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:upsertLoadRule",
        "Create or update a load rule",
        |ctx, params| async move {
            let rule: alert_rules::LoadRuleUpsert = parse_params(params)?;
            let id = alert_rules::upsert_load_rule(&ctx.state.db, rule).await?;
            Ok(json!({ "id": id }))
        },
    );

    registry.register(
        "admin:deleteLoadRule",
        "Delete a load rule",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                id: i64,
            }
            let p: Params = parse_params(params)?;
            alert_rules::delete_load_rule(&ctx.state.db, p.id).await?;
            Ok(json!("ok"))
        },
    );

    // --- admin: clipboard, audit, notifications, oidc ---

    registry.register("admin:getClipboard", "Clipboard entries", |ctx, _| async move {
        let rows = clipboard::list(&ctx.state.db).await?;
        Ok(serde_json::to_value(rows).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:addClipboard",
        "Store a clipboard entry",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                content: String,
            }
            let p: Params = parse_params(params)?;
            let id = clipboard::add(&ctx.state.db, &p.content).await?;
            Ok(json!({ "id": id }))
        },
    );

    registry.register(
        "admin:deleteClipboard",
        "Delete a clipboard entry",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                id: i64,
            }
            let p: Params = parse_params(params)?;
            Ok(json!({ "deleted": clipboard::delete(&ctx.state.db, p.id).await? }))
        },
    );

    registry.register("admin:listAuditLogs", "Recent audit entries", |ctx, params| async move {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Params {
            limit: Option<u64>,
        }
        let p: Params = parse_params(params)?;
        let rows = audit::list_recent(&ctx.state.db, p.limit.unwrap_or(100).min(1000)).await?;
        Ok(serde_json::to_value(rows).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:sendTestNotification",
        "Exercise the configured sink",
        |ctx, _| async move {
            ctx.state
                .notifier
                .notify(AlertEvent {
                    emoji: "🧪".into(),
                    event: "test".into(),
                    client: "-".into(),
                    message: "Test notification from the RPC surface.".into(),
                    time: Utc::now(),
                })
                .await;
            Ok(json!("dispatched"))
        },
    );

    registry.register("admin:listOidcProviders", "External identity providers", |ctx, _| async move {
        let rows = oidc::list(&ctx.state.db).await?;
        Ok(serde_json::to_value(rows).map_err(RpcError::internal)?)
    });

    registry.register(
        "admin:upsertOidcProvider",
        "Create or update a provider",
        |ctx, params| async move {
            let input: oidc::ProviderUpsert = parse_params(params)?;
            oidc::upsert(&ctx.state.db, input).await?;
            Ok(json!("ok"))
        },
    );

    registry.register(
        "admin:deleteOidcProvider",
        "Delete a provider",
        |ctx, params| async move {
            #[derive(Deserialize)]
            struct Params {
                name: String,
            }
            let p: Params = parse_params(params)?;
            oidc::delete(&ctx.state.db, &p.name).await?;
            Ok(json!("ok"))
        },
    );
}

fn default_hours() -> i64 {
    4
}

fn session_user(ctx: &RpcContext) -> Result<String, RpcError> {
    ctx.user_uuid
        .clone()
        .ok_or_else(|| RpcError::invalid_params("a session login is required for this method"))
}

/// Task mutations force a scheduler reload; a reload failure is logged and
/// left to the next reload to repair, the mutation itself already landed.
async fn reload_ping(ctx: &RpcContext) {
    if let Err(e) = ctx.state.ping.reload().await {
        tracing::warn!(error = %e, "ping schedule reload failed after task mutation");
    }
}
