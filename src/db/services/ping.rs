//! Ping task registry and probe observations.
//!
//! Mutating a task does not touch the running workers here; callers reload
//! the ping scheduler after any change so the worker set converges on the
//! stored `enabled` tasks.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, QueryFilter,
    QueryOrder, Set,
};
use serde::Deserialize;

use crate::db::entities::ping_record;
use crate::db::entities::ping_task::{self, ClientList};
use crate::db::services::clients;
use crate::server::frames::PingKind;
use crate::web::error::AppError;

/// Sentinel value recording a lost probe.
pub const LOSS: i32 = -1;

/// Syntactic admission check for a probe target.
pub fn validate_target(kind: PingKind, target: &str) -> Result<(), AppError> {
    let ok = match kind {
        PingKind::Icmp => !target.is_empty() && !target.contains("://") && !target.contains(' '),
        PingKind::Tcp => match target.rsplit_once(':') {
            Some((host, port)) => {
                !host.is_empty() && port.parse::<u16>().map(|p| p > 0).unwrap_or(false)
            }
            None => false,
        },
        PingKind::Http => {
            let rest = target
                .strip_prefix("https://")
                .or_else(|| target.strip_prefix("http://"));
            matches!(rest, Some(r) if !r.is_empty())
        }
    };
    if ok {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "target {target:?} is not valid for a {} probe",
            kind.as_str()
        )))
    }
}

async fn validate_clients(db: &DatabaseConnection, uuids: &[String]) -> Result<(), AppError> {
    if uuids.is_empty() {
        return Err(AppError::InvalidInput(
            "a ping task needs at least one client".into(),
        ));
    }
    for uuid in uuids {
        if clients::get_by_uuid(db, uuid).await?.is_none() {
            return Err(AppError::InvalidInput(format!("unknown client {uuid}")));
        }
    }
    Ok(())
}

pub async fn add_task(
    db: &DatabaseConnection,
    name: &str,
    client_uuids: Vec<String>,
    kind: PingKind,
    target: &str,
    interval: i64,
) -> Result<i64, AppError> {
    if interval < 1 {
        return Err(AppError::InvalidInput("interval must be at least 1 second".into()));
    }
    validate_target(kind, target)?;
    validate_clients(db, &client_uuids).await?;

    let inserted = ping_task::ActiveModel {
        id: NotSet,
        name: Set(name.to_owned()),
        clients: Set(ClientList(client_uuids)),
        kind: Set(kind.as_str().to_owned()),
        target: Set(target.to_owned()),
        interval: Set(interval),
        enabled: Set(true),
    }
    .insert(db)
    .await?;
    Ok(inserted.id)
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PingTaskPatch {
    pub name: Option<String>,
    pub clients: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub kind: Option<PingKind>,
    pub target: Option<String>,
    pub interval: Option<i64>,
    pub enabled: Option<bool>,
}

pub async fn edit_task(
    db: &DatabaseConnection,
    id: i64,
    patch: PingTaskPatch,
) -> Result<ping_task::Model, AppError> {
    let existing = ping_task::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ping task {id}")))?;

    let kind = match patch.kind {
        Some(kind) => kind,
        None => existing
            .kind
            .parse()
            .map_err(|_| AppError::Internal(format!("stored probe kind {:?}", existing.kind)))?,
    };
    let target = patch.target.clone().unwrap_or_else(|| existing.target.clone());
    validate_target(kind, &target)?;
    if let Some(interval) = patch.interval {
        if interval < 1 {
            return Err(AppError::InvalidInput("interval must be at least 1 second".into()));
        }
    }
    if let Some(clients) = &patch.clients {
        validate_clients(db, clients).await?;
    }

    let mut active: ping_task::ActiveModel = existing.into();
    if let Some(v) = patch.name {
        active.name = Set(v);
    }
    if let Some(v) = patch.clients {
        active.clients = Set(ClientList(v));
    }
    active.kind = Set(kind.as_str().to_owned());
    active.target = Set(target.to_owned());
    if let Some(v) = patch.interval {
        active.interval = Set(v);
    }
    if let Some(v) = patch.enabled {
        active.enabled = Set(v);
    }
    Ok(active.update(db).await?)
}

pub async fn delete_tasks(db: &DatabaseConnection, ids: &[i64]) -> Result<u64, AppError> {
    let result = ping_task::Entity::delete_many()
        .filter(ping_task::Column::Id.is_in(ids.to_vec()))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::NotFound("ping task".into()));
    }
    Ok(result.rows_affected)
}

pub async fn get_all_tasks(db: &DatabaseConnection) -> Result<Vec<ping_task::Model>, DbErr> {
    ping_task::Entity::find()
        .order_by_asc(ping_task::Column::Id)
        .all(db)
        .await
}

pub async fn get_enabled_tasks(db: &DatabaseConnection) -> Result<Vec<ping_task::Model>, DbErr> {
    ping_task::Entity::find()
        .filter(ping_task::Column::Enabled.eq(true))
        .order_by_asc(ping_task::Column::Id)
        .all(db)
        .await
}

/// Record one probe observation. Duplicate `(task_id, client, time)` rows
/// are expected and treated as independent observations.
pub async fn save_record(
    db: &DatabaseConnection,
    task_id: i64,
    client: &str,
    value: i32,
) -> Result<(), DbErr> {
    ping_record::ActiveModel {
        id: NotSet,
        task_id: Set(task_id),
        client: Set(client.to_owned()),
        time: Set(Utc::now()),
        value: Set(value),
    }
    .insert(db)
    .await?;
    Ok(())
}

pub async fn delete_records_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    Ok(ping_record::Entity::delete_many()
        .filter(ping_record::Column::Time.lt(cutoff))
        .exec(db)
        .await?
        .rows_affected)
}

pub async fn purge_all_records(db: &DatabaseConnection) -> Result<(), DbErr> {
    ping_record::Entity::delete_many().exec(db).await?;
    Ok(())
}

/// Probe observations filtered by client and/or task over a range, newest
/// first.
pub async fn get_records(
    db: &DatabaseConnection,
    uuid: Option<&str>,
    task_id: Option<i64>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ping_record::Model>, DbErr> {
    let mut query = ping_record::Entity::find()
        .filter(ping_record::Column::Time.gte(start))
        .filter(ping_record::Column::Time.lte(end));
    if let Some(uuid) = uuid {
        query = query.filter(ping_record::Column::Client.eq(uuid));
    }
    if let Some(task_id) = task_id {
        query = query.filter(ping_record::Column::TaskId.eq(task_id));
    }
    query
        .order_by_desc(ping_record::Column::Time)
        .all(db)
        .await
}

/// Per-client aggregate over a set of observations.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PingStats {
    pub client: String,
    pub loss: f64,
    pub min: i32,
    pub max: i32,
    pub avg: i32,
    pub total: usize,
}

/// Group observations by client and compute loss percentage and latency
/// bounds. Loss rows (negative values) count toward the total only.
pub fn aggregate_stats(records: &[ping_record::Model]) -> Vec<PingStats> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Acc {
        total: usize,
        lost: usize,
        sum: i64,
        min: i32,
        max: i32,
    }

    let mut by_client: BTreeMap<&str, Acc> = BTreeMap::new();
    for r in records {
        let acc = by_client.entry(r.client.as_str()).or_default();
        acc.total += 1;
        if r.value < 0 {
            acc.lost += 1;
            continue;
        }
        if acc.min == 0 || r.value < acc.min {
            acc.min = r.value;
        }
        if r.value > acc.max {
            acc.max = r.value;
        }
        acc.sum += i64::from(r.value);
    }

    by_client
        .into_iter()
        .map(|(client, acc)| {
            let valid = acc.total - acc.lost;
            PingStats {
                client: client.to_owned(),
                loss: if acc.total > 0 {
                    acc.lost as f64 / acc.total as f64 * 100.0
                } else {
                    0.0
                },
                min: acc.min,
                max: acc.max,
                avg: if valid > 0 { (acc.sum / valid as i64) as i32 } else { 0 },
                total: acc.total,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_validation_per_kind() {
        assert!(validate_target(PingKind::Icmp, "203.0.113.9").is_ok());
        assert!(validate_target(PingKind::Icmp, "http://x").is_err());
        assert!(validate_target(PingKind::Tcp, "example.com:443").is_ok());
        assert!(validate_target(PingKind::Tcp, "example.com").is_err());
        assert!(validate_target(PingKind::Tcp, "example.com:0").is_err());
        assert!(validate_target(PingKind::Http, "https://example.com/health").is_ok());
        assert!(validate_target(PingKind::Http, "example.com").is_err());
    }

    #[test]
    fn stats_aggregate_loss_and_latency_bounds() {
        let rows: Vec<ping_record::Model> = [10, -1, 30, 20]
            .into_iter()
            .enumerate()
            .map(|(i, value)| ping_record::Model {
                id: i as i64,
                task_id: 1,
                client: "u1".into(),
                time: Utc::now(),
                value,
            })
            .collect();

        let stats = aggregate_stats(&rows);
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert_eq!(s.total, 4);
        assert_eq!(s.min, 10);
        assert_eq!(s.max, 30);
        assert_eq!(s.avg, 20);
        assert!((s.loss - 25.0).abs() < f64::EPSILON);
    }
}
