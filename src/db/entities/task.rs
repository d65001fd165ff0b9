use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::ping_task::ClientList;

/// An ad-hoc command fanned out to a set of agents. Terminal once every
/// listed client has a result row or has been unreachable past the
/// deadline.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub task_id: String,
    pub clients: ClientList,
    #[sea_orm(column_type = "Text")]
    pub command: String,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
