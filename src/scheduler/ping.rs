//! Ping task scheduler: one worker per enabled task, reconciled against the
//! store on every reload.
//!
//! A worker owns nothing but its cancellation token; probe results are
//! correlated by unconditional insert when `ping_result` frames come back,
//! so a worker restart never loses or duplicates state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rand::Rng;
use sea_orm::DatabaseConnection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::entities::ping_task;
use crate::db::services::ping;
use crate::server::frames::{PingKind, ServerFrame};
use crate::server::registry::AgentRegistry;

/// Identity of a running worker; any difference forces a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WorkerKey {
    kind: String,
    target: String,
    interval: i64,
    clients: BTreeSet<String>,
}

impl WorkerKey {
    fn of(task: &ping_task::Model) -> Self {
        Self {
            kind: task.kind.clone(),
            target: task.target.clone(),
            interval: task.interval,
            clients: task.clients.0.iter().cloned().collect(),
        }
    }
}

struct Worker {
    key: WorkerKey,
    cancel: CancellationToken,
}

pub struct PingScheduler {
    db: DatabaseConnection,
    agents: Arc<AgentRegistry>,
    workers: Mutex<HashMap<i64, Worker>>,
    root: CancellationToken,
}

impl PingScheduler {
    pub fn new(
        db: DatabaseConnection,
        agents: Arc<AgentRegistry>,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            agents,
            workers: Mutex::new(HashMap::new()),
            root,
        })
    }

    /// Reconcile running workers with the stored `enabled` tasks: cancel
    /// workers whose task vanished or changed, start workers for new tasks.
    pub async fn reload(&self) -> Result<(), sea_orm::DbErr> {
        let tasks = ping::get_enabled_tasks(&self.db).await?;
        let desired: HashMap<i64, &ping_task::Model> =
            tasks.iter().map(|t| (t.id, t)).collect();

        let mut workers = self.workers.lock().await;
        workers.retain(|id, worker| {
            let keep = desired
                .get(id)
                .map(|task| WorkerKey::of(task) == worker.key)
                .unwrap_or(false);
            if !keep {
                worker.cancel.cancel();
                debug!(task_id = id, "stopped ping worker");
            }
            keep
        });

        for task in &tasks {
            if workers.contains_key(&task.id) {
                continue;
            }
            let Ok(kind) = task.kind.parse::<PingKind>() else {
                warn!(task_id = task.id, kind = %task.kind, "skipping task with unknown probe kind");
                continue;
            };
            let cancel = self.root.child_token();
            workers.insert(
                task.id,
                Worker {
                    key: WorkerKey::of(task),
                    cancel: cancel.clone(),
                },
            );
            tokio::spawn(run_worker(
                self.db.clone(),
                self.agents.clone(),
                task.clone(),
                kind,
                cancel,
            ));
        }
        info!(workers = workers.len(), "ping schedule reloaded");
        Ok(())
    }

    pub async fn running_task_ids(&self) -> Vec<i64> {
        self.workers.lock().await.keys().copied().collect()
    }

    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.values() {
            worker.cancel.cancel();
        }
        workers.clear();
    }
}

async fn run_worker(
    db: DatabaseConnection,
    agents: Arc<AgentRegistry>,
    task: ping_task::Model,
    kind: PingKind,
    cancel: CancellationToken,
) {
    let interval = tokio::time::Duration::from_secs(task.interval.max(1) as u64);

    // Spread the first tick over a random fraction of the interval so many
    // tasks with the same cadence do not fan out probes in lockstep.
    let jitter = {
        let mut rng = rand::thread_rng();
        interval.mul_f64(rng.gen_range(0.0..1.0))
    };
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for uuid in &task.clients.0 {
            match agents.get(uuid) {
                Some(handle) => {
                    let frame = ServerFrame::PingProbe {
                        task_id: task.id,
                        probe: kind,
                        target: task.target.clone(),
                    };
                    if let Err(e) = handle.send(&frame).await {
                        warn!(task_id = task.id, client = %uuid, error = %e, "failed to dispatch probe");
                    }
                }
                // No live connection: record the loss immediately.
                None => {
                    if let Err(e) = ping::save_record(&db, task.id, uuid, ping::LOSS).await {
                        warn!(task_id = task.id, client = %uuid, error = %e, "failed to record probe loss");
                    }
                }
            }
        }
    }
    debug!(task_id = task.id, "ping worker exited");
}
