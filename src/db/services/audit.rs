//! Audit trail. Writing is best-effort: a failed insert is logged and never
//! bubbles into the caller's path.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use tracing::warn;

use crate::db::entities::audit_log;

pub async fn log(db: &DatabaseConnection, ip: &str, uuid: &str, message: &str, kind: &str) {
    let entry = audit_log::ActiveModel {
        id: NotSet,
        time: Set(Utc::now()),
        ip: Set(ip.to_owned()),
        uuid: Set(uuid.to_owned()),
        message: Set(message.to_owned()),
        kind: Set(kind.to_owned()),
    };
    if let Err(e) = entry.insert(db).await {
        warn!(error = %e, kind, "failed to write audit log entry");
    }
}

pub async fn list_recent(
    db: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<audit_log::Model>, DbErr> {
    audit_log::Entity::find()
        .order_by_desc(audit_log::Column::Time)
        .limit(limit)
        .all(db)
        .await
}

pub async fn delete_before(db: &DatabaseConnection, cutoff: DateTime<Utc>) -> Result<u64, DbErr> {
    Ok(audit_log::Entity::delete_many()
        .filter(audit_log::Column::Time.lt(cutoff))
        .exec(db)
        .await?
        .rows_affected)
}
