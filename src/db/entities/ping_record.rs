use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One probe observation. `value` is the round-trip in milliseconds;
/// a negative value (-1) records loss. Rows are never unique per
/// `(task_id, client, time)`; queries aggregate by time bucket.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ping_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    #[serde(skip_serializing)]
    pub id: i64,
    pub task_id: i64,
    pub client: String,
    pub time: ChronoDateTimeUtc,
    pub value: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
