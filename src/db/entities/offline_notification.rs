use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-client offline alerting rule.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "offline_notifications")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub client: String,
    pub enabled: bool,
    /// Seconds the client may stay silent before the rule fires.
    pub grace_period: i64,
    pub notify_on_recovery: bool,
    /// Seconds during which the same edge is not re-fired.
    pub cooldown: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
