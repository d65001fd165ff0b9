use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uuid: String,
    #[sea_orm(unique)]
    pub username: String,
    /// Salted bcrypt digest; never serialized.
    #[serde(skip_serializing)]
    pub passwd: String,
    /// TOTP shared secret, empty when 2FA is disabled.
    #[serde(skip_serializing)]
    pub two_factor: String,
    /// External identity binding `<provider>_<provider-user-id>`, one-to-one.
    pub sso_type: String,
    pub sso_id: String,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
