//! Ad-hoc command tasks and their per-client results.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use uuid::Uuid;

use crate::db::entities::ping_task::ClientList;
use crate::db::entities::{task, task_result};
use crate::web::error::AppError;

pub async fn create_task(
    db: &DatabaseConnection,
    clients: Vec<String>,
    command: &str,
) -> Result<String, AppError> {
    if clients.is_empty() {
        return Err(AppError::InvalidInput("a task needs at least one client".into()));
    }
    if command.trim().is_empty() {
        return Err(AppError::InvalidInput("command must not be empty".into()));
    }
    let task_id = Uuid::new_v4().to_string();
    task::ActiveModel {
        task_id: Set(task_id.clone()),
        clients: Set(ClientList(clients)),
        command: Set(command.to_owned()),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?;
    Ok(task_id)
}

pub async fn get_task(db: &DatabaseConnection, task_id: &str) -> Result<Option<task::Model>, DbErr> {
    task::Entity::find_by_id(task_id.to_owned()).one(db).await
}

/// Store an agent's result exactly once per `(task_id, client)`; a repeated
/// submission is silently ignored.
pub async fn insert_result_if_absent(
    db: &DatabaseConnection,
    task_id: &str,
    client: &str,
    result: &str,
    exit_code: Option<i32>,
    finished_at: Option<DateTime<Utc>>,
) -> Result<bool, DbErr> {
    let existing = task_result::Entity::find_by_id((task_id.to_owned(), client.to_owned()))
        .one(db)
        .await?;
    if existing.is_some() {
        return Ok(false);
    }
    task_result::ActiveModel {
        task_id: Set(task_id.to_owned()),
        client: Set(client.to_owned()),
        result: Set(result.to_owned()),
        exit_code: Set(exit_code),
        finished_at: Set(finished_at),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?;
    Ok(true)
}

pub async fn get_results(
    db: &DatabaseConnection,
    task_id: &str,
) -> Result<Vec<task_result::Model>, DbErr> {
    task_result::Entity::find()
        .filter(task_result::Column::TaskId.eq(task_id))
        .all(db)
        .await
}

/// A task is terminal once every listed client has reported a result.
pub async fn is_terminal(db: &DatabaseConnection, task: &task::Model) -> Result<bool, DbErr> {
    let results = get_results(db, &task.task_id).await?;
    Ok(task
        .clients
        .0
        .iter()
        .all(|uuid| results.iter().any(|r| &r.client == uuid)))
}

pub async fn delete_results_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let results = task_result::Entity::delete_many()
        .filter(task_result::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    task::Entity::delete_many()
        .filter(task::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(results.rows_affected)
}
