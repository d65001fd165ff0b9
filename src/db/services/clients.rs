//! Client (agent) rows and their cascading lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::entities::{
    client, gpu_record, gpu_record_long_term, offline_notification, ping_record, ping_task,
    record, record_long_term, task_result,
};
use crate::event::{Event, EventBus};
use crate::server::frames::BasicInfo;
use crate::utils::{generate_token, secure_compare};
use crate::web::error::AppError;

const TRAFFIC_LIMIT_TYPES: &[&str] = &["sum", "max", "min", "up", "down"];

/// Create a client with a fresh uuid and token. An empty name gets the
/// `client_<uuid-prefix>` placeholder.
pub async fn create_client(
    db: &DatabaseConnection,
    bus: &Arc<EventBus>,
    name: Option<String>,
) -> Result<(String, String), DbErr> {
    let uuid = Uuid::new_v4().to_string();
    let token = generate_token();
    let name = match name {
        Some(n) if !n.is_empty() => n,
        _ => format!("client_{}", &uuid[..8]),
    };
    let now = Utc::now();

    client::ActiveModel {
        uuid: Set(uuid.clone()),
        token: Set(token.clone()),
        name: Set(name.clone()),
        ipv4: Set(String::new()),
        ipv6: Set(String::new()),
        region: Set(String::new()),
        os: Set(String::new()),
        arch: Set(String::new()),
        cpu_name: Set(String::new()),
        cpu_cores: Set(0),
        virtualization: Set(String::new()),
        mem_total: Set(0),
        swap_total: Set(0),
        disk_total: Set(0),
        gpu_name: Set(String::new()),
        version: Set(String::new()),
        weight: Set(0),
        hidden: Set(false),
        public_remark: Set(String::new()),
        remark: Set(String::new()),
        price: Set(0.0),
        billing_cycle_days: Set(0),
        currency: Set(String::new()),
        auto_renewal: Set(false),
        expired_at: Set(None),
        traffic_limit: Set(0),
        traffic_limit_type: Set("sum".to_owned()),
        traffic_billing_anchor_day: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;

    bus.trigger_async(Event::ClientCreated {
        uuid: uuid.clone(),
        name,
    });
    Ok((uuid, token))
}

pub async fn get_by_uuid(
    db: &DatabaseConnection,
    uuid: &str,
) -> Result<Option<client::Model>, DbErr> {
    client::Entity::find_by_id(uuid.to_owned()).one(db).await
}

/// Resolve an agent token to its client row. The indexed lookup narrows the
/// candidate; the stored token is still compared in constant time before the
/// row is accepted.
pub async fn find_by_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<client::Model>, DbErr> {
    if token.is_empty() {
        return Ok(None);
    }
    let candidate = client::Entity::find()
        .filter(client::Column::Token.eq(token))
        .one(db)
        .await?;
    Ok(candidate.filter(|c| secure_compare(&c.token, token)))
}

pub async fn list_all(db: &DatabaseConnection) -> Result<Vec<client::Model>, DbErr> {
    client::Entity::find()
        .order_by_desc(client::Column::Weight)
        .order_by_asc(client::Column::Name)
        .all(db)
        .await
}

/// Public listing: hidden clients filtered out, heaviest first.
pub async fn list_public(db: &DatabaseConnection) -> Result<Vec<client::Model>, DbErr> {
    client::Entity::find()
        .filter(client::Column::Hidden.eq(false))
        .order_by_desc(client::Column::Weight)
        .order_by_asc(client::Column::Name)
        .all(db)
        .await
}

/// Uuids of hidden clients, used to filter guest-facing record queries.
pub async fn hidden_uuids(db: &DatabaseConnection) -> Result<Vec<String>, DbErr> {
    Ok(client::Entity::find()
        .filter(client::Column::Hidden.eq(true))
        .all(db)
        .await?
        .into_iter()
        .map(|c| c.uuid)
        .collect())
}

/// Delete a client and everything it owns in one transaction: records, GPU
/// records, ping records, task results, its offline rule, and its membership
/// in every ping task (dropping tasks that become empty).
pub async fn delete_client(
    db: &DatabaseConnection,
    bus: &Arc<EventBus>,
    uuid: &str,
) -> Result<(), AppError> {
    let existing = get_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("client {uuid}")))?;

    let txn = db.begin().await?;

    record::Entity::delete_many()
        .filter(record::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    record_long_term::Entity::delete_many()
        .filter(record_long_term::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    gpu_record::Entity::delete_many()
        .filter(gpu_record::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    gpu_record_long_term::Entity::delete_many()
        .filter(gpu_record_long_term::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    ping_record::Entity::delete_many()
        .filter(ping_record::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    task_result::Entity::delete_many()
        .filter(task_result::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    offline_notification::Entity::delete_many()
        .filter(offline_notification::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;

    let tasks = ping_task::Entity::find().all(&txn).await?;
    for task in tasks {
        if !task.clients.0.iter().any(|c| c == uuid) {
            continue;
        }
        let remaining: Vec<String> =
            task.clients.0.iter().filter(|c| *c != uuid).cloned().collect();
        if remaining.is_empty() {
            ping_task::Entity::delete_by_id(task.id).exec(&txn).await?;
        } else {
            let mut active: ping_task::ActiveModel = task.into();
            active.clients = Set(ping_task::ClientList(remaining));
            active.update(&txn).await?;
        }
    }

    client::Entity::delete_by_id(uuid.to_owned()).exec(&txn).await?;
    txn.commit().await?;

    bus.trigger_async(Event::ClientDeleted {
        uuid: uuid.to_owned(),
        name: existing.name,
    });
    Ok(())
}

/// Admin-editable fields; absent fields are left untouched.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ClientPatch {
    pub name: Option<String>,
    pub region: Option<String>,
    pub weight: Option<i64>,
    pub hidden: Option<bool>,
    pub public_remark: Option<String>,
    pub remark: Option<String>,
    pub price: Option<f64>,
    pub billing_cycle_days: Option<i64>,
    pub currency: Option<String>,
    pub auto_renewal: Option<bool>,
    pub expired_at: Option<DateTime<Utc>>,
    pub traffic_limit: Option<i64>,
    pub traffic_limit_type: Option<String>,
    pub traffic_billing_anchor_day: Option<i64>,
}

pub async fn update_client(
    db: &DatabaseConnection,
    bus: &Arc<EventBus>,
    uuid: &str,
    patch: ClientPatch,
) -> Result<client::Model, AppError> {
    let existing = get_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("client {uuid}")))?;

    if let Some(kind) = &patch.traffic_limit_type {
        if !TRAFFIC_LIMIT_TYPES.contains(&kind.as_str()) {
            return Err(AppError::InvalidInput(format!(
                "traffic_limit_type must be one of {TRAFFIC_LIMIT_TYPES:?}"
            )));
        }
    }
    if let Some(day) = patch.traffic_billing_anchor_day {
        if !(1..=31).contains(&day) {
            return Err(AppError::InvalidInput(
                "traffic_billing_anchor_day must be within 1..=31".into(),
            ));
        }
    }
    if let Some(limit) = patch.traffic_limit {
        if limit < 0 {
            return Err(AppError::InvalidInput(
                "traffic_limit must be non-negative".into(),
            ));
        }
    }

    let mut active: client::ActiveModel = existing.into();
    if let Some(v) = patch.name {
        active.name = Set(v);
    }
    if let Some(v) = patch.region {
        active.region = Set(v);
    }
    if let Some(v) = patch.weight {
        active.weight = Set(v);
    }
    if let Some(v) = patch.hidden {
        active.hidden = Set(v);
    }
    if let Some(v) = patch.public_remark {
        active.public_remark = Set(v);
    }
    if let Some(v) = patch.remark {
        active.remark = Set(v);
    }
    if let Some(v) = patch.price {
        active.price = Set(v);
    }
    if let Some(v) = patch.billing_cycle_days {
        active.billing_cycle_days = Set(v);
    }
    if let Some(v) = patch.currency {
        active.currency = Set(v);
    }
    if let Some(v) = patch.auto_renewal {
        active.auto_renewal = Set(v);
    }
    if let Some(v) = patch.expired_at {
        active.expired_at = Set(Some(v));
    }
    if let Some(v) = patch.traffic_limit {
        active.traffic_limit = Set(v);
    }
    if let Some(v) = patch.traffic_limit_type {
        active.traffic_limit_type = Set(v);
    }
    if let Some(v) = patch.traffic_billing_anchor_day {
        active.traffic_billing_anchor_day = Set(v);
    }
    active.updated_at = Set(Utc::now());

    let updated = active.update(db).await?;
    bus.trigger_async(Event::ClientUpdated {
        uuid: uuid.to_owned(),
    });
    Ok(updated)
}

/// Apply agent-reported host metadata. Totals must be non-negative; the
/// agent does not get to shrink counters below zero.
pub async fn update_basic_info(
    db: &DatabaseConnection,
    uuid: &str,
    info: BasicInfo,
) -> Result<(), AppError> {
    if info.cpu_cores < 0 || info.mem_total < 0 || info.swap_total < 0 || info.disk_total < 0 {
        return Err(AppError::InvalidInput(
            "hardware totals must be non-negative".into(),
        ));
    }
    let existing = get_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("client {uuid}")))?;

    let mut active: client::ActiveModel = existing.into();
    active.ipv4 = Set(info.ipv4);
    active.ipv6 = Set(info.ipv6);
    active.os = Set(info.os);
    active.arch = Set(info.arch);
    active.cpu_name = Set(info.cpu_name);
    active.cpu_cores = Set(info.cpu_cores);
    active.virtualization = Set(info.virtualization);
    active.mem_total = Set(info.mem_total);
    active.swap_total = Set(info.swap_total);
    active.disk_total = Set(info.disk_total);
    active.gpu_name = Set(info.gpu_name);
    active.version = Set(info.version);
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}
