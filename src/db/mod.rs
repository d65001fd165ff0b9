//! Persistence layer: one shared sea-orm pool over SQLite or MySQL,
//! versioned schema migration, and storage maintenance hooks.

pub mod entities;
pub mod migrate;
pub mod services;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr};
use tracing::info;

/// Open the connection pool. SQLite runs in WAL mode with a busy timeout so
/// the maintenance tasks and the ingest path can interleave.
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opts = ConnectOptions::new(url.to_owned());
    opts.max_connections(10).sqlx_logging(false);
    let db = Database::connect(opts).await?;

    if db.get_database_backend() == DbBackend::Sqlite {
        db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
        db.execute_unprepared("PRAGMA busy_timeout=5000;").await?;
    }
    info!(backend = ?db.get_database_backend(), "database connected");
    Ok(db)
}

/// Truncate the WAL. No-op on MySQL.
pub async fn checkpoint(db: &DatabaseConnection) -> Result<(), DbErr> {
    if db.get_database_backend() == DbBackend::Sqlite {
        db.execute_unprepared("PRAGMA wal_checkpoint(TRUNCATE);")
            .await?;
    }
    Ok(())
}

/// Reclaim free pages. No-op on MySQL.
pub async fn vacuum(db: &DatabaseConnection) -> Result<(), DbErr> {
    if db.get_database_backend() == DbBackend::Sqlite {
        db.execute_unprepared("VACUUM;").await?;
    }
    Ok(())
}
