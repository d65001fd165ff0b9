//! The worker set converges on the stored enabled tasks, and probes against
//! offline members land as loss records.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sea_orm::DatabaseConnection;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use komari::config::ConfigStore;
use komari::db::services::{clients, ping};
use komari::db::{self, migrate};
use komari::event::EventBus;
use komari::scheduler::ping::PingScheduler;
use komari::server::frames::PingKind;
use komari::server::registry::AgentRegistry;

async fn open_test_db() -> (TempDir, Arc<EventBus>, DatabaseConnection) {
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
    (dir, bus, db)
}

#[tokio::test]
async fn worker_set_tracks_enabled_tasks() {
    let (_dir, bus, db) = open_test_db().await;
    let (uuid, _) = clients::create_client(&db, &bus, None).await.unwrap();

    let scheduler = PingScheduler::new(db.clone(), AgentRegistry::new(), CancellationToken::new());
    scheduler.reload().await.unwrap();
    assert!(scheduler.running_task_ids().await.is_empty());

    let id = ping::add_task(&db, "probe", vec![uuid.clone()], PingKind::Icmp, "203.0.113.9", 60)
        .await
        .unwrap();
    scheduler.reload().await.unwrap();
    assert_eq!(scheduler.running_task_ids().await, vec![id]);

    // Disabling the task stops its worker on the next reload.
    ping::edit_task(
        &db,
        id,
        ping::PingTaskPatch {
            enabled: Some(false),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    scheduler.reload().await.unwrap();
    assert!(scheduler.running_task_ids().await.is_empty());

    // Re-enable, then delete: the worker goes away with the row.
    ping::edit_task(
        &db,
        id,
        ping::PingTaskPatch {
            enabled: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    scheduler.reload().await.unwrap();
    assert_eq!(scheduler.running_task_ids().await, vec![id]);

    ping::delete_tasks(&db, &[id]).await.unwrap();
    scheduler.reload().await.unwrap();
    assert!(scheduler.running_task_ids().await.is_empty());
}

#[tokio::test]
async fn changing_a_task_restarts_its_worker() {
    let (_dir, bus, db) = open_test_db().await;
    let (uuid, _) = clients::create_client(&db, &bus, None).await.unwrap();

    let scheduler = PingScheduler::new(db.clone(), AgentRegistry::new(), CancellationToken::new());
    let id = ping::add_task(&db, "probe", vec![uuid.clone()], PingKind::Tcp, "203.0.113.9:443", 60)
        .await
        .unwrap();
    scheduler.reload().await.unwrap();
    assert_eq!(scheduler.running_task_ids().await, vec![id]);

    // A target change is a worker-identity change; the reload swaps the
    // worker but the task id stays.
    ping::edit_task(
        &db,
        id,
        ping::PingTaskPatch {
            target: Some("203.0.113.10:443".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    scheduler.reload().await.unwrap();
    assert_eq!(scheduler.running_task_ids().await, vec![id]);
}

#[tokio::test]
async fn offline_members_get_loss_records() {
    let (_dir, bus, db) = open_test_db().await;
    let (uuid, _) = clients::create_client(&db, &bus, None).await.unwrap();

    // Nobody is connected to the registry, so each tick writes a loss row.
    let scheduler = PingScheduler::new(db.clone(), AgentRegistry::new(), CancellationToken::new());
    ping::add_task(&db, "probe", vec![uuid.clone()], PingKind::Icmp, "203.0.113.9", 1)
        .await
        .unwrap();
    scheduler.reload().await.unwrap();

    // First tick lands within jitter (< 1s) plus one interval.
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    scheduler.stop_all().await;

    let rows = ping::get_records(
        &db,
        Some(&uuid),
        None,
        Utc::now() - Duration::minutes(1),
        Utc::now(),
    )
    .await
    .unwrap();
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| r.value == ping::LOSS));
}
