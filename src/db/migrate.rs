//! Versioned schema migration.
//!
//! Each migration is keyed by a monotonic version string recorded in the
//! `schema_versions` table. On boot the applied set is compared with the
//! compiled list and every missing version runs in order: additive DDL
//! first, then an optional data fix-up. DDL is create-only; columns are
//! never dropped by a migration.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr, EntityTrait, Set,
    Statement,
};
use tracing::{info, warn};

use super::entities::schema_version;
use crate::config::ConfigStore;

/// Versions this build knows about, oldest first.
const VERSIONS: &[&str] = &["1.0.0", "1.2.0"];

pub async fn run(db: &DatabaseConnection, config: &ConfigStore) -> Result<(), DbErr> {
    let backend = db.get_database_backend();

    // The version table itself must exist before we can read it.
    db.execute_unprepared(&format!(
        "CREATE TABLE IF NOT EXISTS schema_versions (\
             version VARCHAR(32) PRIMARY KEY, \
             applied_at {} NOT NULL\
         )",
        datetime_type(backend)
    ))
    .await?;

    let applied: Vec<String> = schema_version::Entity::find()
        .all(db)
        .await?
        .into_iter()
        .map(|m| m.version)
        .collect();

    for &version in VERSIONS {
        if applied.iter().any(|v| v == version) {
            continue;
        }
        info!(version, "applying schema migration");
        match version {
            "1.0.0" => {
                for stmt in baseline_statements(backend) {
                    db.execute_unprepared(&stmt).await?;
                }
            }
            "1.2.0" => migrate_legacy_config(db, config).await?,
            _ => {}
        }
        schema_version::ActiveModel {
            version: Set(version.to_owned()),
            applied_at: Set(Utc::now()),
        }
        .insert(db)
        .await?;
    }
    Ok(())
}

fn datetime_type(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Sqlite => "TEXT",
        _ => "DATETIME",
    }
}

fn baseline_statements(backend: DbBackend) -> Vec<String> {
    let dt = datetime_type(backend);
    let auto_pk = match backend {
        DbBackend::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        _ => "BIGINT PRIMARY KEY AUTO_INCREMENT",
    };
    let json = match backend {
        DbBackend::Sqlite => "TEXT",
        _ => "JSON",
    };

    let record_columns = format!(
        "client VARCHAR(64) NOT NULL, \
         time {dt} NOT NULL, \
         cpu DOUBLE NOT NULL DEFAULT 0, \
         `load` DOUBLE NOT NULL DEFAULT 0, \
         ram BIGINT NOT NULL DEFAULT 0, \
         ram_total BIGINT NOT NULL DEFAULT 0, \
         swap BIGINT NOT NULL DEFAULT 0, \
         swap_total BIGINT NOT NULL DEFAULT 0, \
         disk BIGINT NOT NULL DEFAULT 0, \
         disk_total BIGINT NOT NULL DEFAULT 0, \
         net_in BIGINT NOT NULL DEFAULT 0, \
         net_out BIGINT NOT NULL DEFAULT 0, \
         net_total_up BIGINT NOT NULL DEFAULT 0, \
         net_total_down BIGINT NOT NULL DEFAULT 0, \
         process BIGINT NOT NULL DEFAULT 0, \
         connections BIGINT NOT NULL DEFAULT 0, \
         connections_udp BIGINT NOT NULL DEFAULT 0, \
         temperature DOUBLE NOT NULL DEFAULT 0, \
         PRIMARY KEY (client, time)"
    );
    let gpu_record_columns = format!(
        "client VARCHAR(64) NOT NULL, \
         device_index BIGINT NOT NULL, \
         time {dt} NOT NULL, \
         name VARCHAR(255) NOT NULL DEFAULT '', \
         utilization DOUBLE NOT NULL DEFAULT 0, \
         mem_used BIGINT NOT NULL DEFAULT 0, \
         mem_total BIGINT NOT NULL DEFAULT 0, \
         temperature DOUBLE NOT NULL DEFAULT 0, \
         PRIMARY KEY (client, device_index, time)"
    );

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS clients (\
                 uuid VARCHAR(64) PRIMARY KEY, \
                 token VARCHAR(255) NOT NULL UNIQUE, \
                 name VARCHAR(255) NOT NULL, \
                 ipv4 VARCHAR(64) NOT NULL DEFAULT '', \
                 ipv6 VARCHAR(64) NOT NULL DEFAULT '', \
                 region VARCHAR(64) NOT NULL DEFAULT '', \
                 os VARCHAR(128) NOT NULL DEFAULT '', \
                 arch VARCHAR(64) NOT NULL DEFAULT '', \
                 cpu_name VARCHAR(255) NOT NULL DEFAULT '', \
                 cpu_cores BIGINT NOT NULL DEFAULT 0, \
                 virtualization VARCHAR(64) NOT NULL DEFAULT '', \
                 mem_total BIGINT NOT NULL DEFAULT 0, \
                 swap_total BIGINT NOT NULL DEFAULT 0, \
                 disk_total BIGINT NOT NULL DEFAULT 0, \
                 gpu_name VARCHAR(255) NOT NULL DEFAULT '', \
                 version VARCHAR(64) NOT NULL DEFAULT '', \
                 weight BIGINT NOT NULL DEFAULT 0, \
                 hidden BOOLEAN NOT NULL DEFAULT FALSE, \
                 public_remark TEXT NOT NULL, \
                 remark TEXT NOT NULL, \
                 price DOUBLE NOT NULL DEFAULT 0, \
                 billing_cycle_days BIGINT NOT NULL DEFAULT 0, \
                 currency VARCHAR(16) NOT NULL DEFAULT '', \
                 auto_renewal BOOLEAN NOT NULL DEFAULT FALSE, \
                 expired_at {dt} NULL, \
                 traffic_limit BIGINT NOT NULL DEFAULT 0, \
                 traffic_limit_type VARCHAR(8) NOT NULL DEFAULT 'sum', \
                 traffic_billing_anchor_day BIGINT NOT NULL DEFAULT 1, \
                 created_at {dt} NOT NULL, \
                 updated_at {dt} NOT NULL\
             )"
        ),
        format!("CREATE TABLE IF NOT EXISTS records ({record_columns})"),
        format!("CREATE TABLE IF NOT EXISTS records_long_term ({record_columns})"),
        format!("CREATE TABLE IF NOT EXISTS gpu_records ({gpu_record_columns})"),
        format!("CREATE TABLE IF NOT EXISTS gpu_records_long_term ({gpu_record_columns})"),
        format!(
            "CREATE TABLE IF NOT EXISTS ping_tasks (\
                 id {auto_pk}, \
                 name VARCHAR(255) NOT NULL, \
                 clients {json} NOT NULL, \
                 `type` VARCHAR(8) NOT NULL, \
                 target VARCHAR(512) NOT NULL, \
                 `interval` BIGINT NOT NULL, \
                 enabled BOOLEAN NOT NULL DEFAULT TRUE\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS ping_records (\
                 id {auto_pk}, \
                 task_id BIGINT NOT NULL, \
                 client VARCHAR(64) NOT NULL, \
                 time {dt} NOT NULL, \
                 value INTEGER NOT NULL\
             )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_ping_records_task_time ON ping_records (task_id, time)"
            .to_owned(),
        "CREATE INDEX IF NOT EXISTS idx_ping_records_client_time ON ping_records (client, time)"
            .to_owned(),
        format!(
            "CREATE TABLE IF NOT EXISTS tasks (\
                 task_id VARCHAR(64) PRIMARY KEY, \
                 clients {json} NOT NULL, \
                 command TEXT NOT NULL, \
                 created_at {dt} NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS task_results (\
                 task_id VARCHAR(64) NOT NULL, \
                 client VARCHAR(64) NOT NULL, \
                 result TEXT NOT NULL, \
                 exit_code INTEGER NULL, \
                 finished_at {dt} NULL, \
                 created_at {dt} NOT NULL, \
                 PRIMARY KEY (task_id, client)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS users (\
                 uuid VARCHAR(64) PRIMARY KEY, \
                 username VARCHAR(255) NOT NULL UNIQUE, \
                 passwd VARCHAR(255) NOT NULL, \
                 two_factor VARCHAR(255) NOT NULL DEFAULT '', \
                 sso_type VARCHAR(64) NOT NULL DEFAULT '', \
                 sso_id VARCHAR(255) NOT NULL DEFAULT '', \
                 created_at {dt} NOT NULL, \
                 updated_at {dt} NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS sessions (\
                 token VARCHAR(64) PRIMARY KEY, \
                 uuid VARCHAR(64) NOT NULL, \
                 user_agent TEXT NOT NULL, \
                 ip VARCHAR(64) NOT NULL DEFAULT '', \
                 login_method VARCHAR(32) NOT NULL DEFAULT 'password', \
                 latest_online {dt} NOT NULL, \
                 expires_at {dt} NOT NULL, \
                 created_at {dt} NOT NULL\
             )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_sessions_uuid ON sessions (uuid)".to_owned(),
        format!(
            "CREATE TABLE IF NOT EXISTS audit_logs (\
                 id {auto_pk}, \
                 time {dt} NOT NULL, \
                 ip VARCHAR(64) NOT NULL DEFAULT '', \
                 uuid VARCHAR(64) NOT NULL DEFAULT '', \
                 message TEXT NOT NULL, \
                 `type` VARCHAR(32) NOT NULL DEFAULT 'log'\
             )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_audit_logs_time ON audit_logs (time)".to_owned(),
        format!(
            "CREATE TABLE IF NOT EXISTS offline_notifications (\
                 client VARCHAR(64) PRIMARY KEY, \
                 enabled BOOLEAN NOT NULL DEFAULT TRUE, \
                 grace_period BIGINT NOT NULL DEFAULT 180, \
                 notify_on_recovery BOOLEAN NOT NULL DEFAULT TRUE, \
                 cooldown BIGINT NOT NULL DEFAULT 600\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS load_notifications (\
                 id {auto_pk}, \
                 name VARCHAR(255) NOT NULL, \
                 clients {json} NOT NULL, \
                 metric VARCHAR(16) NOT NULL, \
                 comparator VARCHAR(4) NOT NULL, \
                 threshold DOUBLE NOT NULL, \
                 duration_seconds BIGINT NOT NULL, \
                 cooldown BIGINT NOT NULL DEFAULT 1800, \
                 enabled BOOLEAN NOT NULL DEFAULT TRUE\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS clipboard (\
                 id {auto_pk}, \
                 content TEXT NOT NULL, \
                 created_at {dt} NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS oidc_providers (\
                 id {auto_pk}, \
                 name VARCHAR(64) NOT NULL UNIQUE, \
                 client_id VARCHAR(255) NOT NULL, \
                 client_secret VARCHAR(255) NOT NULL, \
                 authorize_url VARCHAR(512) NOT NULL DEFAULT '', \
                 token_url VARCHAR(512) NOT NULL DEFAULT '', \
                 user_info_url VARCHAR(512) NOT NULL DEFAULT '', \
                 scopes VARCHAR(255) NOT NULL DEFAULT '', \
                 enabled BOOLEAN NOT NULL DEFAULT FALSE\
             )"
        ),
    ]
}

/// Older deployments kept settings in a `configs` key/value table. Fold any
/// surviving rows into the file-based config, then drop the table.
async fn migrate_legacy_config(
    db: &DatabaseConnection,
    config: &ConfigStore,
) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let exists_sql = match backend {
        DbBackend::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'configs'".to_owned()
        }
        _ => "SELECT table_name AS name FROM information_schema.tables \
              WHERE table_schema = DATABASE() AND table_name = 'configs'"
            .to_owned(),
    };
    let exists = db
        .query_one(Statement::from_string(backend, exists_sql))
        .await?
        .is_some();
    if !exists {
        return Ok(());
    }

    let rows = db
        .query_all(Statement::from_string(
            backend,
            "SELECT `key`, `value` FROM configs".to_owned(),
        ))
        .await?;
    let mut patch = serde_json::Map::new();
    for row in &rows {
        let key: String = row.try_get("", "key")?;
        let value: String = row.try_get("", "value")?;
        let parsed = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
        patch.insert(key, parsed);
    }
    if !patch.is_empty() {
        if let Err(e) = config.save_partial(serde_json::Value::Object(patch)) {
            warn!(error = %e, "failed to fold legacy config rows into the config file");
        }
    }
    db.execute_unprepared("DROP TABLE configs").await?;
    info!(rows = rows.len(), "migrated legacy config table");
    Ok(())
}
