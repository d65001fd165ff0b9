use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One minute-aggregated GPU sample, one row per device per minute.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "gpu_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub client: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub device_index: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub time: ChronoDateTimeUtc,
    pub name: String,
    pub utilization: f64,
    pub mem_used: i64,
    pub mem_total: i64,
    pub temperature: f64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
