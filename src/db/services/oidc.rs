//! External identity provider rows. The OAuth flow itself is handled
//! outside the core; these rows only carry the endpoints and credentials.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, QueryFilter,
    Set,
};
use serde::Deserialize;

use crate::db::entities::oidc_provider;
use crate::web::error::AppError;

pub async fn list(db: &DatabaseConnection) -> Result<Vec<oidc_provider::Model>, DbErr> {
    oidc_provider::Entity::find().all(db).await
}

pub async fn get_by_name(
    db: &DatabaseConnection,
    name: &str,
) -> Result<Option<oidc_provider::Model>, DbErr> {
    oidc_provider::Entity::find()
        .filter(oidc_provider::Column::Name.eq(name))
        .one(db)
        .await
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderUpsert {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub scopes: String,
    pub enabled: bool,
}

pub async fn upsert(db: &DatabaseConnection, input: ProviderUpsert) -> Result<(), AppError> {
    if input.name.is_empty() {
        return Err(AppError::InvalidInput("provider name is required".into()));
    }
    match get_by_name(db, &input.name).await? {
        Some(existing) => {
            let mut active: oidc_provider::ActiveModel = existing.into();
            active.client_id = Set(input.client_id);
            active.client_secret = Set(input.client_secret);
            active.authorize_url = Set(input.authorize_url);
            active.token_url = Set(input.token_url);
            active.user_info_url = Set(input.user_info_url);
            active.scopes = Set(input.scopes);
            active.enabled = Set(input.enabled);
            active.update(db).await?;
        }
        None => {
            oidc_provider::ActiveModel {
                id: NotSet,
                name: Set(input.name),
                client_id: Set(input.client_id),
                client_secret: Set(input.client_secret),
                authorize_url: Set(input.authorize_url),
                token_url: Set(input.token_url),
                user_info_url: Set(input.user_info_url),
                scopes: Set(input.scopes),
                enabled: Set(input.enabled),
            }
            .insert(db)
            .await?;
        }
    }
    Ok(())
}

pub async fn delete(db: &DatabaseConnection, name: &str) -> Result<(), AppError> {
    let result = oidc_provider::Entity::delete_many()
        .filter(oidc_provider::Column::Name.eq(name))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::NotFound(format!("provider {name}")));
    }
    Ok(())
}
