use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Downsampled sister table of `records`: identical shape, one row per
/// 15-minute bucket.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "records_long_term")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub client: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub time: ChronoDateTimeUtc,
    pub cpu: f64,
    pub load: f64,
    pub ram: i64,
    pub ram_total: i64,
    pub swap: i64,
    pub swap_total: i64,
    pub disk: i64,
    pub disk_total: i64,
    pub net_in: i64,
    pub net_out: i64,
    pub net_total_up: i64,
    pub net_total_down: i64,
    pub process: i64,
    pub connections: i64,
    pub connections_udp: i64,
    pub temperature: f64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
