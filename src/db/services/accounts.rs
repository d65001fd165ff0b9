//! Users, sessions, two-factor enrollment and external identity binding.
//!
//! Login timing is equalized: when the username does not exist the password
//! is still verified against a dummy digest so the failure path costs one
//! KDF round either way.

use std::sync::OnceLock;

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::db::entities::{session, user};
use crate::utils::{generate_token, random_string};
use crate::web::error::AppError;

pub const TWO_FACTOR_ISSUER: &str = "Komari Monitor";
/// Default session lifetime: 30 days.
pub const SESSION_TTL_SECONDS: i64 = 30 * 24 * 3600;

fn dummy_digest() -> &'static str {
    static DIGEST: OnceLock<String> = OnceLock::new();
    DIGEST.get_or_init(|| {
        bcrypt::hash("komari-timing-equalizer", bcrypt::DEFAULT_COST).unwrap_or_default()
    })
}

/// Create the initial admin account when the user table is empty. Returns
/// the generated credentials so the caller can print them once.
pub async fn ensure_default_admin(
    db: &DatabaseConnection,
) -> Result<Option<(String, String)>, AppError> {
    if user::Entity::find().one(db).await?.is_some() {
        return Ok(None);
    }
    let password = random_string(12);
    let digest = bcrypt::hash(&password, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))?;
    let now = Utc::now();
    user::ActiveModel {
        uuid: Set(Uuid::new_v4().to_string()),
        username: Set("admin".to_owned()),
        passwd: Set(digest),
        two_factor: Set(String::new()),
        sso_type: Set(String::new()),
        sso_id: Set(String::new()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(Some(("admin".to_owned(), password)))
}

pub async fn get_user_by_uuid(
    db: &DatabaseConnection,
    uuid: &str,
) -> Result<Option<user::Model>, DbErr> {
    user::Entity::find_by_id(uuid.to_owned()).one(db).await
}

pub async fn get_user_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<user::Model>, DbErr> {
    user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .one(db)
        .await
}

/// First user by creation time; this is a single-admin system and the CLI
/// password reset targets this row.
pub async fn first_user(db: &DatabaseConnection) -> Result<Option<user::Model>, DbErr> {
    user::Entity::find()
        .order_by_asc(user::Column::CreatedAt)
        .one(db)
        .await
}

/// Verify a password, returning the user uuid on success. Takes roughly the
/// same time whether the user exists or not.
pub async fn check_password(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<Option<String>, DbErr> {
    let found = get_user_by_username(db, username).await?;
    match found {
        Some(user) => {
            let ok = bcrypt::verify(password, &user.passwd).unwrap_or(false);
            Ok(ok.then_some(user.uuid))
        }
        None => {
            let _ = bcrypt::verify(password, dummy_digest());
            Ok(None)
        }
    }
}

pub async fn force_reset_password(
    db: &DatabaseConnection,
    username: &str,
    new_password: &str,
) -> Result<(), AppError> {
    let user = get_user_by_username(db, username)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {username}")))?;
    let digest = bcrypt::hash(new_password, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))?;
    let mut active: user::ActiveModel = user.into();
    active.passwd = Set(digest);
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

// --- Sessions ---

pub async fn create_session(
    db: &DatabaseConnection,
    user_uuid: &str,
    ttl_seconds: i64,
    user_agent: &str,
    ip: &str,
    login_method: &str,
) -> Result<String, DbErr> {
    let token = generate_token();
    let now = Utc::now();
    session::ActiveModel {
        token: Set(token.clone()),
        uuid: Set(user_uuid.to_owned()),
        user_agent: Set(user_agent.to_owned()),
        ip: Set(ip.to_owned()),
        login_method: Set(login_method.to_owned()),
        latest_online: Set(now),
        expires_at: Set(now + Duration::seconds(ttl_seconds)),
        created_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(token)
}

/// Resolve a session token; expired rows are deleted on sight.
pub async fn get_session(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<session::Model>, DbErr> {
    if token.is_empty() {
        return Ok(None);
    }
    let Some(found) = session::Entity::find_by_id(token.to_owned()).one(db).await? else {
        return Ok(None);
    };
    if found.expires_at < Utc::now() {
        session::Entity::delete_by_id(token.to_owned()).exec(db).await?;
        return Ok(None);
    }
    Ok(Some(found))
}

pub async fn touch_session(
    db: &DatabaseConnection,
    token: &str,
    user_agent: &str,
    ip: &str,
) -> Result<(), DbErr> {
    use sea_orm::sea_query::Expr;
    session::Entity::update_many()
        .col_expr(session::Column::LatestOnline, Expr::value(Utc::now()))
        .col_expr(session::Column::UserAgent, Expr::value(user_agent))
        .col_expr(session::Column::Ip, Expr::value(ip))
        .filter(session::Column::Token.eq(token))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn delete_session(db: &DatabaseConnection, token: &str) -> Result<(), DbErr> {
    session::Entity::delete_by_id(token.to_owned()).exec(db).await?;
    Ok(())
}

pub async fn list_sessions(
    db: &DatabaseConnection,
    user_uuid: &str,
) -> Result<Vec<session::Model>, DbErr> {
    session::Entity::find()
        .filter(session::Column::Uuid.eq(user_uuid))
        .order_by_desc(session::Column::LatestOnline)
        .all(db)
        .await
}

pub async fn list_all_sessions(db: &DatabaseConnection) -> Result<Vec<session::Model>, DbErr> {
    session::Entity::find()
        .order_by_desc(session::Column::LatestOnline)
        .all(db)
        .await
}

pub async fn delete_all_sessions(db: &DatabaseConnection) -> Result<u64, DbErr> {
    Ok(session::Entity::delete_many().exec(db).await?.rows_affected)
}

// --- Two-factor (RFC 6238) ---

fn build_totp(secret_base32: &str, account: &str) -> Result<TOTP, AppError> {
    let secret = Secret::Encoded(secret_base32.to_owned())
        .to_bytes()
        .map_err(|e| AppError::Internal(format!("invalid TOTP secret: {e:?}")))?;
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some(TWO_FACTOR_ISSUER.to_owned()),
        account.to_owned(),
    )
    .map_err(|e| AppError::Internal(format!("TOTP setup failed: {e}")))
}

/// Generate an enrollment secret and its otpauth:// provisioning URL.
pub fn generate_two_factor(account: &str) -> Result<(String, String), AppError> {
    let secret = Secret::generate_secret();
    let encoded = secret.to_encoded().to_string();
    let totp = build_totp(&encoded, account)?;
    Ok((encoded, totp.get_url()))
}

pub async fn enable_two_factor(
    db: &DatabaseConnection,
    uuid: &str,
    secret: &str,
) -> Result<(), AppError> {
    let user = get_user_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {uuid}")))?;
    let mut active: user::ActiveModel = user.into();
    active.two_factor = Set(secret.to_owned());
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

/// Validate a 2FA code against the stored secret, accepting the current
/// step and one step of skew either side. Users without a secret fail.
pub async fn verify_two_factor(
    db: &DatabaseConnection,
    uuid: &str,
    code: &str,
) -> Result<bool, AppError> {
    let Some(user) = get_user_by_uuid(db, uuid).await? else {
        return Ok(false);
    };
    if user.two_factor.is_empty() {
        return Ok(false);
    }
    let totp = build_totp(&user.two_factor, &user.username)?;
    Ok(totp.check_current(code).unwrap_or(false))
}

pub async fn disable_two_factor(db: &DatabaseConnection, uuid: &str) -> Result<(), AppError> {
    let user = get_user_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {uuid}")))?;
    let mut active: user::ActiveModel = user.into();
    active.two_factor = Set(String::new());
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

// --- External identity ---

/// Stable binding id `<provider>_<provider-user-id>`.
pub fn sso_id(provider: &str, provider_user_id: &str) -> String {
    format!("{provider}_{provider_user_id}")
}

pub async fn find_user_by_sso(
    db: &DatabaseConnection,
    provider: &str,
    provider_user_id: &str,
) -> Result<Option<user::Model>, DbErr> {
    user::Entity::find()
        .filter(user::Column::SsoType.eq(provider))
        .filter(user::Column::SsoId.eq(sso_id(provider, provider_user_id)))
        .one(db)
        .await
}

/// Bind an external identity to a user. The mapping is one-to-one in both
/// directions; a binding held by another user is a conflict.
pub async fn bind_sso(
    db: &DatabaseConnection,
    uuid: &str,
    provider: &str,
    provider_user_id: &str,
) -> Result<(), AppError> {
    if let Some(holder) = find_user_by_sso(db, provider, provider_user_id).await? {
        if holder.uuid != uuid {
            return Err(AppError::Conflict(
                "this external account is already bound to another user".into(),
            ));
        }
        return Ok(());
    }
    let user = get_user_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {uuid}")))?;
    let mut active: user::ActiveModel = user.into();
    active.sso_type = Set(provider.to_owned());
    active.sso_id = Set(sso_id(provider, provider_user_id));
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

pub async fn unbind_sso(db: &DatabaseConnection, uuid: &str) -> Result<(), AppError> {
    let user = get_user_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {uuid}")))?;
    let mut active: user::ActiveModel = user.into();
    active.sso_type = Set(String::new());
    active.sso_id = Set(String::new());
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sso_ids_compose_provider_and_subject() {
        assert_eq!(sso_id("github", "8841"), "github_8841");
    }

    #[test]
    fn generated_totp_codes_verify_with_the_same_secret() {
        let (secret, url) = generate_two_factor("admin").unwrap();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("Komari%20Monitor"));

        let totp = build_totp(&secret, "admin").unwrap();
        let code = totp.generate_current().unwrap();
        assert!(totp.check_current(&code).unwrap());
    }
}
