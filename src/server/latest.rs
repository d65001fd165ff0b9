//! Latest-state cache: per client, the Reports received over the last 60
//! seconds. This window is authoritative for live dashboard queries and for
//! offline detection; the aggregator drains it once per minute.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::{Mutex, RwLock};

use super::frames::Report;

/// Wall-clock bound of the ring; the window is bounded by time, not count.
const WINDOW_SECONDS: i64 = 60;

type Ring = Arc<Mutex<Vec<Report>>>;

#[derive(Default)]
pub struct LatestStateCache {
    rings: RwLock<HashMap<String, Ring>>,
}

impl LatestStateCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn ring(&self, uuid: &str) -> Ring {
        if let Some(ring) = self.rings.read().get(uuid) {
            return ring.clone();
        }
        self.rings
            .write()
            .entry(uuid.to_owned())
            .or_default()
            .clone()
    }

    /// Append a report, dropping anything that has aged out of the window.
    pub fn push(&self, uuid: &str, report: Report) {
        let ring = self.ring(uuid);
        let mut window = ring.lock();
        window.push(report);
        let cutoff = Utc::now() - Duration::seconds(WINDOW_SECONDS);
        window.retain(|r| r.updated_at > cutoff);
    }

    /// Current window for one client, purged on read.
    pub fn window(&self, uuid: &str) -> Vec<Report> {
        let ring = match self.rings.read().get(uuid) {
            Some(ring) => ring.clone(),
            None => return Vec::new(),
        };
        let cutoff = Utc::now() - Duration::seconds(WINDOW_SECONDS);
        let mut window = ring.lock();
        window.retain(|r| r.updated_at > cutoff);
        window.clone()
    }

    /// The newest report for one client, if any survived the window.
    pub fn latest(&self, uuid: &str) -> Option<Report> {
        self.window(uuid).into_iter().last()
    }

    /// Drain every non-empty window, returning the consumed samples per
    /// client. Used by the minute aggregator.
    pub fn drain_all(&self) -> HashMap<String, Vec<Report>> {
        let rings: Vec<(String, Ring)> = self
            .rings
            .read()
            .iter()
            .map(|(uuid, ring)| (uuid.clone(), ring.clone()))
            .collect();

        let cutoff = Utc::now() - Duration::seconds(WINDOW_SECONDS);
        let mut drained = HashMap::new();
        for (uuid, ring) in rings {
            let mut window = ring.lock();
            window.retain(|r| r.updated_at > cutoff);
            if !window.is_empty() {
                drained.insert(uuid, std::mem::take(&mut *window));
            }
        }
        drained
    }

    /// Drop the ring for a deleted client.
    pub fn remove(&self, uuid: &str) {
        self.rings.write().remove(uuid);
    }

    /// Uuids that currently have at least one live report.
    pub fn online_uuids(&self) -> Vec<String> {
        let rings: Vec<(String, Ring)> = self
            .rings
            .read()
            .iter()
            .map(|(uuid, ring)| (uuid.clone(), ring.clone()))
            .collect();
        let cutoff = Utc::now() - Duration::seconds(WINDOW_SECONDS);
        rings
            .into_iter()
            .filter(|(_, ring)| ring.lock().iter().any(|r| r.updated_at > cutoff))
            .map(|(uuid, _)| uuid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_at(age_seconds: i64, cpu: f64) -> Report {
        Report {
            cpu,
            updated_at: Utc::now() - Duration::seconds(age_seconds),
            ..Report::default()
        }
    }

    #[test]
    fn window_drops_samples_older_than_sixty_seconds() {
        let cache = LatestStateCache::new();
        cache.push("u1", report_at(120, 10.0));
        cache.push("u1", report_at(5, 20.0));

        let window = cache.window("u1");
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].cpu, 20.0);
    }

    #[test]
    fn drain_consumes_the_window() {
        let cache = LatestStateCache::new();
        cache.push("u1", report_at(1, 42.0));
        cache.push("u2", report_at(2, 7.0));

        let drained = cache.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(cache.window("u1").is_empty());
        assert!(cache.window("u2").is_empty());
    }

    #[test]
    fn remove_forgets_the_client() {
        let cache = LatestStateCache::new();
        cache.push("gone", report_at(1, 1.0));
        cache.remove("gone");
        assert!(cache.window("gone").is_empty());
        assert!(cache.online_uuids().is_empty());
    }
}
