use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "audit_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub time: ChronoDateTimeUtc,
    pub ip: String,
    /// User or client uuid the entry concerns, empty when unknown.
    pub uuid: String,
    #[sea_orm(column_type = "Text")]
    pub message: String,
    /// `login`, `logout`, `warn`, ...
    #[sea_orm(column_name = "type")]
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
