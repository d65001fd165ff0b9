use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A monitored host. The row is the root of ownership: deleting it cascades
/// records, GPU records, ping records, task results and ping task
/// membership for the uuid.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uuid: String,
    /// Opaque agent credential, unique across the fleet.
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub token: String,
    pub name: String,

    // Display metadata, reported by the agent or set by the admin.
    pub ipv4: String,
    pub ipv6: String,
    pub region: String,
    pub os: String,
    pub arch: String,
    pub cpu_name: String,
    pub cpu_cores: i64,
    pub virtualization: String,
    pub mem_total: i64,
    pub swap_total: i64,
    pub disk_total: i64,
    pub gpu_name: String,
    pub version: String,

    // Lifecycle metadata.
    pub weight: i64,
    pub hidden: bool,
    pub public_remark: String,
    /// Admin-only remark, never exposed on public paths.
    #[serde(skip_serializing)]
    pub remark: String,
    pub price: f64,
    pub billing_cycle_days: i64,
    pub currency: String,
    pub auto_renewal: bool,
    pub expired_at: Option<ChronoDateTimeUtc>,

    // Traffic billing.
    pub traffic_limit: i64,
    /// One of `sum`, `max`, `min`, `up`, `down`.
    pub traffic_limit_type: String,
    /// Day of month the billing period starts on.
    pub traffic_billing_anchor_day: i64,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
