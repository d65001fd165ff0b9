//! End-to-end storage behavior against a scratch SQLite database:
//! migration, ownership cascades, aggregator idempotency and retention.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use tempfile::TempDir;

use komari::config::ConfigStore;
use komari::db::entities::{ping_record, ping_task, record};
use komari::db::services::{accounts, clients, ping, records, tasks};
use komari::db::{self, migrate};
use komari::event::EventBus;

async fn open_test_db() -> (TempDir, Arc<EventBus>, Arc<ConfigStore>, DatabaseConnection) {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let config = Arc::new(
        ConfigStore::open(dir.path().join("komari.json"), bus.clone())
            .await
            .unwrap(),
    );
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("komari.db").display());
    let db = db::connect(&url).await.unwrap();
    migrate::run(&db, &config).await.unwrap();
    (dir, bus, config, db)
}

fn minute(offset_minutes: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(offset_minutes)
}

fn record_row(uuid: &str, time: chrono::DateTime<Utc>, cpu: f64) -> record::ActiveModel {
    record::ActiveModel {
        client: Set(uuid.to_owned()),
        time: Set(time),
        cpu: Set(cpu),
        load: Set(0.5),
        ram: Set(1024),
        ram_total: Set(4096),
        swap: Set(0),
        swap_total: Set(0),
        disk: Set(10),
        disk_total: Set(100),
        net_in: Set(1000),
        net_out: Set(2000),
        net_total_up: Set(1_000_000),
        net_total_down: Set(2_000_000),
        process: Set(120),
        connections: Set(40),
        connections_udp: Set(5),
        temperature: Set(45.0),
    }
}

#[tokio::test]
async fn migration_is_idempotent() {
    let (_dir, _bus, config, db) = open_test_db().await;
    // A second run sees every version applied and does nothing.
    migrate::run(&db, &config).await.unwrap();
}

#[tokio::test]
async fn timestamps_round_trip_to_the_second() {
    let (_dir, bus, _config, db) = open_test_db().await;
    let (uuid, _token) = clients::create_client(&db, &bus, None).await.unwrap();

    let submitted = Utc.with_ymd_and_hms(2025, 3, 15, 23, 59, 58).unwrap();
    records::insert_minute_batch(&db, vec![record_row(&uuid, submitted, 10.0)], vec![])
        .await
        .unwrap();

    let read_back = records::get_by_client_and_range(
        &db,
        &uuid,
        submitted - Duration::seconds(1),
        submitted + Duration::seconds(1),
    )
    .await
    .unwrap();
    assert_eq!(read_back.len(), 1);
    assert_eq!(read_back[0].time, submitted);
}

#[tokio::test]
async fn minute_insert_is_idempotent_per_client_minute() {
    let (_dir, bus, _config, db) = open_test_db().await;
    let (uuid, _token) = clients::create_client(&db, &bus, None).await.unwrap();

    let t = minute(0);
    records::insert_minute_batch(&db, vec![record_row(&uuid, t, 10.0)], vec![])
        .await
        .unwrap();
    // Re-inserting the same minute replaces, never duplicates.
    records::insert_minute_batch(&db, vec![record_row(&uuid, t, 99.0)], vec![])
        .await
        .unwrap();

    let rows = records::get_by_client_and_range(&db, &uuid, t - Duration::minutes(1), t + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].cpu, 99.0);
}

#[tokio::test]
async fn deleting_a_client_cascades_everything_it_owns() {
    let (_dir, bus, _config, db) = open_test_db().await;
    let (victim, _) = clients::create_client(&db, &bus, Some("victim".into())).await.unwrap();
    let (survivor, _) = clients::create_client(&db, &bus, Some("survivor".into())).await.unwrap();

    records::insert_minute_batch(&db, vec![record_row(&victim, minute(0), 10.0)], vec![])
        .await
        .unwrap();

    // One shared task, one task owned exclusively by the victim.
    let shared = ping::add_task(
        &db,
        "shared",
        vec![victim.clone(), survivor.clone()],
        komari::server::frames::PingKind::Icmp,
        "203.0.113.1",
        10,
    )
    .await
    .unwrap();
    let exclusive = ping::add_task(
        &db,
        "exclusive",
        vec![victim.clone()],
        komari::server::frames::PingKind::Tcp,
        "203.0.113.1:443",
        10,
    )
    .await
    .unwrap();
    ping::save_record(&db, shared, &victim, 12).await.unwrap();

    let task_id = tasks::create_task(&db, vec![victim.clone()], "uptime").await.unwrap();
    tasks::insert_result_if_absent(&db, &task_id, &victim, "up 10 days", Some(0), None)
        .await
        .unwrap();

    clients::delete_client(&db, &bus, &victim).await.unwrap();

    assert!(clients::get_by_uuid(&db, &victim).await.unwrap().is_none());
    assert!(records::get_by_client_and_range(&db, &victim, minute(-10), minute(10))
        .await
        .unwrap()
        .is_empty());
    assert!(ping_record::Entity::find().all(&db).await.unwrap().is_empty());
    assert!(tasks::get_results(&db, &task_id).await.unwrap().is_empty());

    // Shared task lost the membership, exclusive task is gone entirely.
    let remaining = ping::get_all_tasks(&db).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, shared);
    assert_eq!(remaining[0].clients.0, vec![survivor.clone()]);
    assert!(ping_task::Entity::find_by_id(exclusive).one(&db).await.unwrap().is_none());
}

#[tokio::test]
async fn retention_prunes_only_aged_rows() {
    let (_dir, bus, _config, db) = open_test_db().await;
    let (uuid, _) = clients::create_client(&db, &bus, None).await.unwrap();

    let old = Utc::now() - Duration::hours(1000);
    let fresh = Utc::now() - Duration::minutes(5);
    records::insert_minute_batch(
        &db,
        vec![record_row(&uuid, old, 1.0), record_row(&uuid, fresh, 2.0)],
        vec![],
    )
    .await
    .unwrap();

    let cutoff = Utc::now() - Duration::hours(720);
    let deleted = records::delete_before(&db, cutoff).await.unwrap();
    assert_eq!(deleted, 1);

    let left = records::get_by_client_and_range(&db, &uuid, Utc::now() - Duration::hours(2000), Utc::now())
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].cpu, 2.0);
}

#[tokio::test]
async fn compaction_moves_aged_rows_into_long_term_buckets() {
    let (_dir, bus, _config, db) = open_test_db().await;
    let (uuid, _) = clients::create_client(&db, &bus, None).await.unwrap();

    // Three minute rows inside one 15-minute bucket, well past any threshold.
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
    records::insert_minute_batch(
        &db,
        vec![
            record_row(&uuid, base, 10.0),
            record_row(&uuid, base + Duration::minutes(1), 20.0),
            record_row(&uuid, base + Duration::minutes(2), 30.0),
        ],
        vec![],
    )
    .await
    .unwrap();

    let cutoff = Utc::now() - Duration::hours(180);
    let hot = records::fetch_before(&db, cutoff).await.unwrap();
    assert_eq!(hot.len(), 3);

    let long_term = komari::pipeline::downsample_records(&hot);
    records::apply_compaction(&db, cutoff, long_term, vec![]).await.unwrap();

    // Hot rows are gone, one bucket row remains, aligned to 15 minutes.
    assert!(records::fetch_before(&db, cutoff).await.unwrap().is_empty());
    let merged = records::get_by_client_and_range(&db, &uuid, base - Duration::hours(1), base + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].time, base);
    assert_eq!(merged[0].client, uuid);
}

#[tokio::test]
async fn sessions_expire_and_passwords_verify() {
    let (_dir, _bus, _config, db) = open_test_db().await;
    let created = accounts::ensure_default_admin(&db).await.unwrap();
    let (username, password) = created.expect("first boot creates the admin");

    assert!(accounts::check_password(&db, &username, &password)
        .await
        .unwrap()
        .is_some());
    assert!(accounts::check_password(&db, &username, "wrong")
        .await
        .unwrap()
        .is_none());
    assert!(accounts::check_password(&db, "nobody", "whatever")
        .await
        .unwrap()
        .is_none());

    let user = accounts::get_user_by_username(&db, &username).await.unwrap().unwrap();
    let token = accounts::create_session(&db, &user.uuid, 3600, "ua", "127.0.0.1", "password")
        .await
        .unwrap();
    assert!(accounts::get_session(&db, &token).await.unwrap().is_some());

    let expired = accounts::create_session(&db, &user.uuid, -10, "ua", "127.0.0.1", "password")
        .await
        .unwrap();
    assert!(accounts::get_session(&db, &expired).await.unwrap().is_none());

    accounts::delete_all_sessions(&db).await.unwrap();
    assert!(accounts::get_session(&db, &token).await.unwrap().is_none());
}

#[tokio::test]
async fn ping_task_validation_rejects_bad_admissions() {
    let (_dir, bus, _config, db) = open_test_db().await;
    let (uuid, _) = clients::create_client(&db, &bus, None).await.unwrap();

    // Unknown member uuid.
    assert!(ping::add_task(
        &db,
        "x",
        vec!["not-a-client".into()],
        komari::server::frames::PingKind::Icmp,
        "203.0.113.1",
        10,
    )
    .await
    .is_err());

    // Sub-second interval.
    assert!(ping::add_task(
        &db,
        "x",
        vec![uuid.clone()],
        komari::server::frames::PingKind::Icmp,
        "203.0.113.1",
        0,
    )
    .await
    .is_err());

    // Empty client list.
    assert!(ping::add_task(
        &db,
        "x",
        vec![],
        komari::server::frames::PingKind::Icmp,
        "203.0.113.1",
        10,
    )
    .await
    .is_err());
}
