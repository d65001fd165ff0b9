use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::ping_task::ClientList;

/// Sustained-load alerting rule: fires when every record of the window
/// satisfies `comparator(metric, threshold)`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "load_notifications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub clients: ClientList,
    /// One of `cpu`, `ram`, `disk`, `load`, `net_in`, `net_out`.
    pub metric: String,
    /// One of `>`, `>=`, `<`, `<=`.
    pub comparator: String,
    pub threshold: f64,
    pub duration_seconds: i64,
    pub cooldown: i64,
    pub enabled: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
