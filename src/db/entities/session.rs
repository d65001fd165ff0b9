use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A web session bound to the device that created it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    #[serde(skip_serializing)]
    pub token: String,
    pub uuid: String,
    pub user_agent: String,
    pub ip: String,
    /// `password`, `oidc`, ...
    pub login_method: String,
    pub latest_online: ChronoDateTimeUtc,
    pub expires_at: ChronoDateTimeUtc,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
