//! Admin clipboard, a small convenience store for snippets.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, QueryOrder, Set,
};

use crate::db::entities::clipboard;

pub async fn list(db: &DatabaseConnection) -> Result<Vec<clipboard::Model>, DbErr> {
    clipboard::Entity::find()
        .order_by_desc(clipboard::Column::CreatedAt)
        .all(db)
        .await
}

pub async fn add(db: &DatabaseConnection, content: &str) -> Result<i64, DbErr> {
    let inserted = clipboard::ActiveModel {
        id: NotSet,
        content: Set(content.to_owned()),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?;
    Ok(inserted.id)
}

pub async fn delete(db: &DatabaseConnection, id: i64) -> Result<bool, DbErr> {
    Ok(clipboard::Entity::delete_by_id(id).exec(db).await?.rows_affected > 0)
}
