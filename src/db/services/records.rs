//! Record storage: minute batch inserts, range queries spanning the hot and
//! long-term tables, retention deletes and the compaction primitives.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::db::entities::{gpu_record, gpu_record_long_term, record, record_long_term};

/// Transient driver failures (lock contention, pool exhaustion) are retried
/// once with a short backoff; anything else surfaces immediately.
fn is_transient(err: &DbErr) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("lock") || text.contains("busy") || text.contains("timeout")
}

/// Insert one minute's aggregation in a single transaction. The composite
/// `(client, time)` key makes re-insertion of the same minute idempotent:
/// last write wins.
pub async fn insert_minute_batch(
    db: &DatabaseConnection,
    records: Vec<record::ActiveModel>,
    gpu_records: Vec<gpu_record::ActiveModel>,
) -> Result<(), DbErr> {
    if records.is_empty() && gpu_records.is_empty() {
        return Ok(());
    }
    match try_insert_batch(db, records.clone(), gpu_records.clone()).await {
        Err(e) if is_transient(&e) => {
            warn!(error = %e, "transient failure on record batch insert, retrying once");
            sleep(Duration::from_millis(200)).await;
            try_insert_batch(db, records, gpu_records).await
        }
        other => other,
    }
}

async fn try_insert_batch(
    db: &DatabaseConnection,
    records: Vec<record::ActiveModel>,
    gpu_records: Vec<gpu_record::ActiveModel>,
) -> Result<(), DbErr> {
    let txn = db.begin().await?;
    if !records.is_empty() {
        record::Entity::insert_many(records)
            .on_conflict(
                OnConflict::columns([record::Column::Client, record::Column::Time])
                    .update_columns([
                        record::Column::Cpu,
                        record::Column::Load,
                        record::Column::Ram,
                        record::Column::RamTotal,
                        record::Column::Swap,
                        record::Column::SwapTotal,
                        record::Column::Disk,
                        record::Column::DiskTotal,
                        record::Column::NetIn,
                        record::Column::NetOut,
                        record::Column::NetTotalUp,
                        record::Column::NetTotalDown,
                        record::Column::Process,
                        record::Column::Connections,
                        record::Column::ConnectionsUdp,
                        record::Column::Temperature,
                    ])
                    .to_owned(),
            )
            .exec(&txn)
            .await?;
    }
    if !gpu_records.is_empty() {
        gpu_record::Entity::insert_many(gpu_records)
            .on_conflict(
                OnConflict::columns([
                    gpu_record::Column::Client,
                    gpu_record::Column::DeviceIndex,
                    gpu_record::Column::Time,
                ])
                .update_columns([
                    gpu_record::Column::Name,
                    gpu_record::Column::Utilization,
                    gpu_record::Column::MemUsed,
                    gpu_record::Column::MemTotal,
                    gpu_record::Column::Temperature,
                ])
                .to_owned(),
            )
            .exec(&txn)
            .await?;
    }
    txn.commit().await
}

/// Load records for one client over a time range, merging the hot table
/// with the long-term table, oldest first.
pub async fn get_by_client_and_range(
    db: &DatabaseConnection,
    uuid: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<record::Model>, DbErr> {
    let mut hot = record::Entity::find()
        .filter(record::Column::Client.eq(uuid))
        .filter(record::Column::Time.gte(start))
        .filter(record::Column::Time.lte(end))
        .order_by_asc(record::Column::Time)
        .all(db)
        .await?;

    let long_term = record_long_term::Entity::find()
        .filter(record_long_term::Column::Client.eq(uuid))
        .filter(record_long_term::Column::Time.gte(start))
        .filter(record_long_term::Column::Time.lte(end))
        .order_by_asc(record_long_term::Column::Time)
        .all(db)
        .await?;

    let mut merged: Vec<record::Model> = long_term
        .into_iter()
        .map(|m| record::Model {
            client: m.client,
            time: m.time,
            cpu: m.cpu,
            load: m.load,
            ram: m.ram,
            ram_total: m.ram_total,
            swap: m.swap,
            swap_total: m.swap_total,
            disk: m.disk,
            disk_total: m.disk_total,
            net_in: m.net_in,
            net_out: m.net_out,
            net_total_up: m.net_total_up,
            net_total_down: m.net_total_down,
            process: m.process,
            connections: m.connections,
            connections_udp: m.connections_udp,
            temperature: m.temperature,
        })
        .collect();
    merged.append(&mut hot);
    merged.sort_by_key(|r| r.time);
    Ok(merged)
}

/// Newest record for one client, hot table only.
pub async fn latest_for_client(
    db: &DatabaseConnection,
    uuid: &str,
) -> Result<Option<record::Model>, DbErr> {
    record::Entity::find()
        .filter(record::Column::Client.eq(uuid))
        .order_by_desc(record::Column::Time)
        .one(db)
        .await
}

/// Oldest record at or after `since`, hot then long-term. Used as the
/// traffic-budget baseline at the billing anchor.
pub async fn first_since(
    db: &DatabaseConnection,
    uuid: &str,
    since: DateTime<Utc>,
) -> Result<Option<record::Model>, DbErr> {
    if let Some(found) = record::Entity::find()
        .filter(record::Column::Client.eq(uuid))
        .filter(record::Column::Time.gte(since))
        .order_by_asc(record::Column::Time)
        .one(db)
        .await?
    {
        return Ok(Some(found));
    }
    Ok(record_long_term::Entity::find()
        .filter(record_long_term::Column::Client.eq(uuid))
        .filter(record_long_term::Column::Time.gte(since))
        .order_by_asc(record_long_term::Column::Time)
        .one(db)
        .await?
        .map(|m| record::Model {
            client: m.client,
            time: m.time,
            cpu: m.cpu,
            load: m.load,
            ram: m.ram,
            ram_total: m.ram_total,
            swap: m.swap,
            swap_total: m.swap_total,
            disk: m.disk,
            disk_total: m.disk_total,
            net_in: m.net_in,
            net_out: m.net_out,
            net_total_up: m.net_total_up,
            net_total_down: m.net_total_down,
            process: m.process,
            connections: m.connections,
            connections_udp: m.connections_udp,
            temperature: m.temperature,
        }))
}

/// Prune the hot tables at the preserve horizon.
pub async fn delete_before(db: &DatabaseConnection, cutoff: DateTime<Utc>) -> Result<u64, DbErr> {
    let mut deleted = 0;
    deleted += record::Entity::delete_many()
        .filter(record::Column::Time.lt(cutoff))
        .exec(db)
        .await?
        .rows_affected;
    deleted += gpu_record::Entity::delete_many()
        .filter(gpu_record::Column::Time.lt(cutoff))
        .exec(db)
        .await?
        .rows_affected;
    Ok(deleted)
}

/// Prune the long-term tables; they roll on a coarser horizon than the hot
/// tables.
pub async fn delete_long_term_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let mut deleted = 0;
    deleted += record_long_term::Entity::delete_many()
        .filter(record_long_term::Column::Time.lt(cutoff))
        .exec(db)
        .await?
        .rows_affected;
    deleted += gpu_record_long_term::Entity::delete_many()
        .filter(gpu_record_long_term::Column::Time.lt(cutoff))
        .exec(db)
        .await?
        .rows_affected;
    Ok(deleted)
}

/// Drop every record and GPU record; used when recording is globally
/// disabled.
pub async fn purge_all(db: &DatabaseConnection) -> Result<(), DbErr> {
    record::Entity::delete_many().exec(db).await?;
    gpu_record::Entity::delete_many().exec(db).await?;
    record_long_term::Entity::delete_many().exec(db).await?;
    gpu_record_long_term::Entity::delete_many().exec(db).await?;
    Ok(())
}

/// Hot rows older than `cutoff`, oldest first, for the compactor.
pub async fn fetch_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<record::Model>, DbErr> {
    record::Entity::find()
        .filter(record::Column::Time.lt(cutoff))
        .order_by_asc(record::Column::Client)
        .order_by_asc(record::Column::Time)
        .all(db)
        .await
}

pub async fn fetch_gpu_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<gpu_record::Model>, DbErr> {
    gpu_record::Entity::find()
        .filter(gpu_record::Column::Time.lt(cutoff))
        .order_by_asc(gpu_record::Column::Client)
        .order_by_asc(gpu_record::Column::Time)
        .all(db)
        .await
}

/// Move downsampled rows into the long-term tables and drop the consumed
/// hot rows, all in one transaction.
pub async fn apply_compaction(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
    long_term: Vec<record_long_term::ActiveModel>,
    gpu_long_term: Vec<gpu_record_long_term::ActiveModel>,
) -> Result<(), DbErr> {
    let txn = db.begin().await?;
    if !long_term.is_empty() {
        record_long_term::Entity::insert_many(long_term)
            .on_conflict(
                OnConflict::columns([
                    record_long_term::Column::Client,
                    record_long_term::Column::Time,
                ])
                .update_columns([
                    record_long_term::Column::Cpu,
                    record_long_term::Column::Load,
                    record_long_term::Column::Ram,
                    record_long_term::Column::RamTotal,
                    record_long_term::Column::Swap,
                    record_long_term::Column::SwapTotal,
                    record_long_term::Column::Disk,
                    record_long_term::Column::DiskTotal,
                    record_long_term::Column::NetIn,
                    record_long_term::Column::NetOut,
                    record_long_term::Column::NetTotalUp,
                    record_long_term::Column::NetTotalDown,
                    record_long_term::Column::Process,
                    record_long_term::Column::Connections,
                    record_long_term::Column::ConnectionsUdp,
                    record_long_term::Column::Temperature,
                ])
                .to_owned(),
            )
            .exec(&txn)
            .await?;
    }
    if !gpu_long_term.is_empty() {
        gpu_record_long_term::Entity::insert_many(gpu_long_term)
            .on_conflict(
                OnConflict::columns([
                    gpu_record_long_term::Column::Client,
                    gpu_record_long_term::Column::DeviceIndex,
                    gpu_record_long_term::Column::Time,
                ])
                .update_columns([
                    gpu_record_long_term::Column::Name,
                    gpu_record_long_term::Column::Utilization,
                    gpu_record_long_term::Column::MemUsed,
                    gpu_record_long_term::Column::MemTotal,
                    gpu_record_long_term::Column::Temperature,
                ])
                .to_owned(),
            )
            .exec(&txn)
            .await?;
    }
    record::Entity::delete_many()
        .filter(record::Column::Time.lt(cutoff))
        .exec(&txn)
        .await?;
    gpu_record::Entity::delete_many()
        .filter(gpu_record::Column::Time.lt(cutoff))
        .exec(&txn)
        .await?;
    txn.commit().await
}
