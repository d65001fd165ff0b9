//! Record pipeline: burst-to-minute aggregation, retention and compaction.
//!
//! Once a minute the latest-state windows are drained and flattened into one
//! Record per client via an exponentially weighted moving average; every 30
//! minutes old rows age out and rows past the compaction threshold are
//! downsampled into the long-term tables. Storage maintenance (WAL
//! checkpoint, vacuum) rides the 5-minute and daily ticks.

mod aggregate;
mod compact;

pub use aggregate::{aggregate_gpu_samples, aggregate_reports, minute_of, ALPHA};
pub use compact::{downsample_gpu_records, downsample_records};

use std::sync::Arc;

use chrono::{Duration, Utc};
use sea_orm::DatabaseConnection;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::db;
use crate::db::services::{audit, ping, records, tasks};
use crate::event::{EventBus, EventError, Topic};
use crate::server::latest::LatestStateCache;

/// Long-term rows roll out after this multiple of the hot preserve time.
const LONG_TERM_PRESERVE_FACTOR: i64 = 4;

pub struct RecordPipeline {
    db: DatabaseConnection,
    latest: Arc<LatestStateCache>,
    config: Arc<ConfigStore>,
}

impl RecordPipeline {
    pub fn new(
        db: DatabaseConnection,
        latest: Arc<LatestStateCache>,
        config: Arc<ConfigStore>,
    ) -> Arc<Self> {
        Arc::new(Self { db, latest, config })
    }

    /// Wire the pipeline onto the scheduler topics.
    pub fn register(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let pipeline = self.clone();
        bus.on(Topic::SchedulerEvery1m, 0, move |_| {
            let pipeline = pipeline.clone();
            async move { pipeline.run_minute().await }
        });

        let pipeline = self.clone();
        bus.on(Topic::SchedulerEvery30m, 0, move |_| {
            let pipeline = pipeline.clone();
            async move {
                pipeline.run_compaction().await?;
                pipeline.run_retention().await
            }
        });

        let pipeline = self.clone();
        bus.on(Topic::SchedulerEvery5m, 0, move |_| {
            let pipeline = pipeline.clone();
            async move {
                db::checkpoint(&pipeline.db).await?;
                Ok(())
            }
        });

        let pipeline = self.clone();
        bus.on(Topic::SchedulerEvery1d, 0, move |_| {
            let pipeline = pipeline.clone();
            async move {
                db::vacuum(&pipeline.db).await?;
                Ok(())
            }
        });
    }

    /// Flatten each client's report window into one minute Record and batch
    /// insert. With recording disabled this purges instead.
    pub async fn run_minute(&self) -> Result<(), EventError> {
        let config = self.config.get();
        if !config.record.enabled {
            records::purge_all(&self.db).await?;
            ping::purge_all_records(&self.db).await?;
            return Ok(());
        }

        let drained = self.latest.drain_all();
        if drained.is_empty() {
            return Ok(());
        }

        let minute = minute_of(Utc::now());
        let mut record_rows = Vec::with_capacity(drained.len());
        let mut gpu_rows = Vec::new();
        for (uuid, samples) in &drained {
            record_rows.push(aggregate_reports(uuid, samples, minute));
            gpu_rows.extend(aggregate_gpu_samples(uuid, samples, minute));
        }

        let count = record_rows.len();
        records::insert_minute_batch(&self.db, record_rows, gpu_rows).await?;
        debug!(clients = count, "flushed minute records");
        Ok(())
    }

    /// Delete rows that aged past their preserve windows. A failure on one
    /// table does not stop the others.
    pub async fn run_retention(&self) -> Result<(), EventError> {
        let config = self.config.get();
        let now = Utc::now();

        let record_cutoff = now - Duration::hours(config.record.record_preserve_time);
        if let Err(e) = records::delete_before(&self.db, record_cutoff).await {
            warn!(error = %e, "record retention failed");
        }
        let long_term_cutoff =
            now - Duration::hours(config.record.record_preserve_time * LONG_TERM_PRESERVE_FACTOR);
        if let Err(e) = records::delete_long_term_before(&self.db, long_term_cutoff).await {
            warn!(error = %e, "long-term retention failed");
        }
        let ping_cutoff = now - Duration::hours(config.record.ping_record_preserve_time);
        if let Err(e) = ping::delete_records_before(&self.db, ping_cutoff).await {
            warn!(error = %e, "ping record retention failed");
        }
        if let Err(e) = tasks::delete_results_before(&self.db, record_cutoff).await {
            warn!(error = %e, "task result retention failed");
        }
        let audit_cutoff = now - Duration::hours(config.record.audit_preserve_time);
        if let Err(e) = audit::delete_before(&self.db, audit_cutoff).await {
            warn!(error = %e, "audit log retention failed");
        }
        Ok(())
    }

    /// Downsample hot rows older than the compaction threshold into the
    /// long-term tables; originals are removed in the same transaction.
    pub async fn run_compaction(&self) -> Result<(), EventError> {
        let config = self.config.get();
        let threshold_hours = config.record.effective_compaction_threshold();
        if threshold_hours <= 0 {
            return Ok(());
        }
        let cutoff = Utc::now() - Duration::hours(threshold_hours);

        let hot = records::fetch_before(&self.db, cutoff).await?;
        let gpu_hot = records::fetch_gpu_before(&self.db, cutoff).await?;
        if hot.is_empty() && gpu_hot.is_empty() {
            return Ok(());
        }

        let long_term = compact::downsample_records(&hot);
        let gpu_long_term = compact::downsample_gpu_records(&gpu_hot);
        let moved = long_term.len();
        records::apply_compaction(&self.db, cutoff, long_term, gpu_long_term).await?;
        info!(
            source_rows = hot.len() + gpu_hot.len(),
            bucket_rows = moved,
            "compacted records into long-term storage"
        );
        Ok(())
    }
}
