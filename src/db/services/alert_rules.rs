//! Alerting rule rows. Evaluation state (edges, cooldowns) lives in the
//! evaluator; the rows only describe what to watch.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, QueryFilter,
    QueryOrder, Set,
};
use serde::Deserialize;

use crate::db::entities::ping_task::ClientList;
use crate::db::entities::{load_notification, offline_notification};
use crate::web::error::AppError;

pub const LOAD_METRICS: &[&str] = &["cpu", "ram", "disk", "load", "net_in", "net_out"];
pub const COMPARATORS: &[&str] = &[">", ">=", "<", "<="];

pub async fn get_offline_rules(
    db: &DatabaseConnection,
) -> Result<Vec<offline_notification::Model>, DbErr> {
    offline_notification::Entity::find()
        .filter(offline_notification::Column::Enabled.eq(true))
        .all(db)
        .await
}

pub async fn list_offline_rules(
    db: &DatabaseConnection,
) -> Result<Vec<offline_notification::Model>, DbErr> {
    offline_notification::Entity::find().all(db).await
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineRuleUpsert {
    pub client: String,
    pub enabled: bool,
    pub grace_period: i64,
    pub notify_on_recovery: bool,
    pub cooldown: i64,
}

impl Default for OfflineRuleUpsert {
    fn default() -> Self {
        Self {
            client: String::new(),
            enabled: true,
            grace_period: 180,
            notify_on_recovery: true,
            cooldown: 600,
        }
    }
}

pub async fn upsert_offline_rule(
    db: &DatabaseConnection,
    rule: OfflineRuleUpsert,
) -> Result<(), AppError> {
    if rule.client.is_empty() {
        return Err(AppError::InvalidInput("client uuid is required".into()));
    }
    if rule.grace_period < 1 {
        return Err(AppError::InvalidInput("grace_period must be positive".into()));
    }
    let model = offline_notification::ActiveModel {
        client: Set(rule.client.clone()),
        enabled: Set(rule.enabled),
        grace_period: Set(rule.grace_period),
        notify_on_recovery: Set(rule.notify_on_recovery),
        cooldown: Set(rule.cooldown),
    };
    let existing = offline_notification::Entity::find_by_id(rule.client.clone())
        .one(db)
        .await?;
    if existing.is_some() {
        model.update(db).await?;
    } else {
        model.insert(db).await?;
    }
    Ok(())
}

pub async fn delete_offline_rule(db: &DatabaseConnection, client: &str) -> Result<(), DbErr> {
    offline_notification::Entity::delete_by_id(client.to_owned())
        .exec(db)
        .await?;
    Ok(())
}

pub async fn get_load_rules(
    db: &DatabaseConnection,
) -> Result<Vec<load_notification::Model>, DbErr> {
    load_notification::Entity::find()
        .filter(load_notification::Column::Enabled.eq(true))
        .order_by_asc(load_notification::Column::Id)
        .all(db)
        .await
}

pub async fn list_load_rules(
    db: &DatabaseConnection,
) -> Result<Vec<load_notification::Model>, DbErr> {
    load_notification::Entity::find()
        .order_by_asc(load_notification::Column::Id)
        .all(db)
        .await
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadRuleUpsert {
    pub id: Option<i64>,
    pub name: String,
    pub clients: Vec<String>,
    pub metric: String,
    pub comparator: String,
    pub threshold: f64,
    pub duration_seconds: i64,
    pub cooldown: i64,
    pub enabled: bool,
}

impl Default for LoadRuleUpsert {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            clients: Vec::new(),
            metric: "cpu".into(),
            comparator: ">=".into(),
            threshold: 0.0,
            duration_seconds: 300,
            cooldown: 1800,
            enabled: true,
        }
    }
}

pub async fn upsert_load_rule(
    db: &DatabaseConnection,
    rule: LoadRuleUpsert,
) -> Result<i64, AppError> {
    if rule.clients.is_empty() {
        return Err(AppError::InvalidInput("a load rule needs at least one client".into()));
    }
    if !LOAD_METRICS.contains(&rule.metric.as_str()) {
        return Err(AppError::InvalidInput(format!(
            "metric must be one of {LOAD_METRICS:?}"
        )));
    }
    if !COMPARATORS.contains(&rule.comparator.as_str()) {
        return Err(AppError::InvalidInput(format!(
            "comparator must be one of {COMPARATORS:?}"
        )));
    }
    if rule.duration_seconds < 60 {
        return Err(AppError::InvalidInput(
            "duration_seconds must be at least 60".into(),
        ));
    }

    match rule.id {
        Some(id) => {
            let existing = load_notification::Entity::find_by_id(id)
                .one(db)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("load rule {id}")))?;
            let mut active: load_notification::ActiveModel = existing.into();
            active.name = Set(rule.name);
            active.clients = Set(ClientList(rule.clients));
            active.metric = Set(rule.metric);
            active.comparator = Set(rule.comparator);
            active.threshold = Set(rule.threshold);
            active.duration_seconds = Set(rule.duration_seconds);
            active.cooldown = Set(rule.cooldown);
            active.enabled = Set(rule.enabled);
            active.update(db).await?;
            Ok(id)
        }
        None => {
            let inserted = load_notification::ActiveModel {
                id: NotSet,
                name: Set(rule.name),
                clients: Set(ClientList(rule.clients)),
                metric: Set(rule.metric),
                comparator: Set(rule.comparator),
                threshold: Set(rule.threshold),
                duration_seconds: Set(rule.duration_seconds),
                cooldown: Set(rule.cooldown),
                enabled: Set(rule.enabled),
            }
            .insert(db)
            .await?;
            Ok(inserted.id)
        }
    }
}

pub async fn delete_load_rule(db: &DatabaseConnection, id: i64) -> Result<(), AppError> {
    let result = load_notification::Entity::delete_by_id(id).exec(db).await?;
    if result.rows_affected == 0 {
        return Err(AppError::NotFound(format!("load rule {id}")));
    }
    Ok(())
}
