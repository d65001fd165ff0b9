//! Alert evaluation: offline edges, sustained load, traffic budgets and
//! expiry warnings.
//!
//! Every evaluator runs on the minute tick (expiry on the daily tick), keeps
//! its edge/cooldown state in memory, and treats each rule independently: a
//! failing rule is logged and the cycle moves on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use sea_orm::DatabaseConnection;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::ConfigStore;
use crate::db::entities::{client, load_notification, record};
use crate::db::services::{alert_rules, clients, records};
use crate::event::{EventBus, EventError, Topic};
use crate::notifications::{AlertEvent, NotificationHub};
use crate::server::latest::LatestStateCache;

#[derive(Default)]
struct AlertState {
    /// Last observed offline flag per client; edges fire on change only.
    offline: HashMap<String, bool>,
    /// Cooldown per `(client, offline-edge)`.
    offline_fired: HashMap<(String, bool), DateTime<Utc>>,
    /// Cooldown per `(rule id, client)`.
    load_fired: HashMap<(i64, String), DateTime<Utc>>,
    /// Billing period start for which the traffic warning already fired.
    traffic_warned: HashMap<String, DateTime<Utc>>,
    /// Expiry instant a warning was already sent for.
    expiry_warned: HashMap<String, DateTime<Utc>>,
}

pub struct AlertEvaluator {
    db: DatabaseConnection,
    latest: Arc<LatestStateCache>,
    config: Arc<ConfigStore>,
    notifier: Arc<NotificationHub>,
    state: Mutex<AlertState>,
}

impl AlertEvaluator {
    pub fn new(
        db: DatabaseConnection,
        latest: Arc<LatestStateCache>,
        config: Arc<ConfigStore>,
        notifier: Arc<NotificationHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            latest,
            config,
            notifier,
            state: Mutex::new(AlertState::default()),
        })
    }

    pub fn register(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let evaluator = self.clone();
        bus.on(Topic::SchedulerEvery1m, -10, move |_| {
            let evaluator = evaluator.clone();
            async move { evaluator.evaluate_minute().await }
        });

        let evaluator = self.clone();
        bus.on(Topic::SchedulerEvery1d, -10, move |_| {
            let evaluator = evaluator.clone();
            async move { evaluator.evaluate_expiry().await }
        });
    }

    pub async fn evaluate_minute(&self) -> Result<(), EventError> {
        if let Err(e) = self.evaluate_offline().await {
            warn!(error = %e, "offline evaluation failed");
        }
        if let Err(e) = self.evaluate_load().await {
            warn!(error = %e, "load evaluation failed");
        }
        if let Err(e) = self.evaluate_traffic().await {
            warn!(error = %e, "traffic evaluation failed");
        }
        Ok(())
    }

    async fn client_name(&self, uuid: &str) -> String {
        clients::get_by_uuid(&self.db, uuid)
            .await
            .ok()
            .flatten()
            .map(|c| c.name)
            .unwrap_or_else(|| uuid.to_owned())
    }

    async fn evaluate_offline(&self) -> Result<(), EventError> {
        let rules = alert_rules::get_offline_rules(&self.db).await?;
        let now = Utc::now();

        for rule in rules {
            let offline = is_offline(&self.latest.window(&rule.client), now, rule.grace_period);
            let mut state = self.state.lock().await;

            let previous = match state.offline.get(&rule.client) {
                Some(previous) => *previous,
                None => {
                    // First observation after boot establishes the baseline
                    // without firing.
                    state.offline.insert(rule.client.clone(), offline);
                    continue;
                }
            };
            if previous == offline {
                continue;
            }
            state.offline.insert(rule.client.clone(), offline);

            let edge = (rule.client.clone(), offline);
            if let Some(last) = state.offline_fired.get(&edge) {
                if now - *last < Duration::seconds(rule.cooldown) {
                    continue;
                }
            }
            state.offline_fired.insert(edge, now);
            drop(state);

            let name = self.client_name(&rule.client).await;
            if offline {
                let since = now - Duration::seconds(rule.grace_period);
                self.notifier
                    .notify(AlertEvent {
                        emoji: "🔴".into(),
                        event: "offline".into(),
                        client: name,
                        message: format!(
                            "No reports since {} (grace {}s).",
                            since.format("%Y-%m-%d %H:%M:%S UTC"),
                            rule.grace_period
                        ),
                        time: now,
                    })
                    .await;
            } else if rule.notify_on_recovery {
                self.notifier
                    .notify(AlertEvent {
                        emoji: "🟢".into(),
                        event: "online".into(),
                        client: name,
                        message: "Client is reporting again.".into(),
                        time: now,
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn evaluate_load(&self) -> Result<(), EventError> {
        let rules = alert_rules::get_load_rules(&self.db).await?;
        let now = Utc::now();

        for rule in rules {
            for uuid in &rule.clients.0 {
                match self.load_rule_holds(&rule, uuid, now).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(rule = rule.id, client = %uuid, error = %e, "load rule evaluation failed");
                        continue;
                    }
                }

                let mut state = self.state.lock().await;
                let key = (rule.id, uuid.clone());
                if let Some(last) = state.load_fired.get(&key) {
                    if now - *last < Duration::seconds(rule.cooldown) {
                        continue;
                    }
                }
                state.load_fired.insert(key, now);
                drop(state);

                let name = self.client_name(uuid).await;
                self.notifier
                    .notify(AlertEvent {
                        emoji: "🔥".into(),
                        event: "load.sustained".into(),
                        client: name,
                        message: format!(
                            "{} {} {} sustained for {}s (rule {:?}).",
                            rule.metric, rule.comparator, rule.threshold,
                            rule.duration_seconds, rule.name
                        ),
                        time: now,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Every record of the window must satisfy the comparison; an empty
    /// window never fires.
    async fn load_rule_holds(
        &self,
        rule: &load_notification::Model,
        uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sea_orm::DbErr> {
        let window =
            records::get_by_client_and_range(&self.db, uuid, now - Duration::seconds(rule.duration_seconds), now)
                .await?;
        if window.is_empty() {
            return Ok(false);
        }
        Ok(window
            .iter()
            .all(|r| compare(&rule.comparator, metric_value(r, &rule.metric), rule.threshold)))
    }

    async fn evaluate_traffic(&self) -> Result<(), EventError> {
        let limit_percentage = self.config.get().notification.traffic_limit_percentage;
        let now = Utc::now();

        for c in clients::list_all(&self.db).await? {
            if c.traffic_limit <= 0 {
                continue;
            }
            match self.traffic_usage(&c, now).await {
                Ok(Some(usage)) => {
                    let used_pct = usage as f64 / c.traffic_limit as f64 * 100.0;
                    if used_pct < limit_percentage {
                        continue;
                    }
                    let period = period_start(now, c.traffic_billing_anchor_day);
                    let mut state = self.state.lock().await;
                    if state.traffic_warned.get(&c.uuid) == Some(&period) {
                        continue;
                    }
                    state.traffic_warned.insert(c.uuid.clone(), period);
                    drop(state);

                    self.notifier
                        .notify(AlertEvent {
                            emoji: "📶".into(),
                            event: "traffic.warning".into(),
                            client: c.name.clone(),
                            message: format!(
                                "Period usage {used_pct:.1}% of {} bytes ({}).",
                                c.traffic_limit, c.traffic_limit_type
                            ),
                            time: now,
                        })
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(client = %c.uuid, error = %e, "traffic evaluation failed");
                }
            }
        }
        Ok(())
    }

    /// Period-to-date usage per the client's billing mode: the latest
    /// counters against the snapshot at the anchor.
    async fn traffic_usage(
        &self,
        c: &client::Model,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, sea_orm::DbErr> {
        let period = period_start(now, c.traffic_billing_anchor_day);
        let Some(baseline) = records::first_since(&self.db, &c.uuid, period).await? else {
            return Ok(None);
        };
        let Some(latest) = records::latest_for_client(&self.db, &c.uuid).await? else {
            return Ok(None);
        };
        let up = (latest.net_total_up - baseline.net_total_up).max(0);
        let down = (latest.net_total_down - baseline.net_total_down).max(0);
        Ok(Some(usage_for(&c.traffic_limit_type, up, down)))
    }

    /// Daily expiry check: warn once per agent per expiry window.
    pub async fn evaluate_expiry(&self) -> Result<(), EventError> {
        let lead_days = self.config.get().notification.expire_notification_lead_days;
        let now = Utc::now();

        for c in clients::list_all(&self.db).await? {
            if c.auto_renewal {
                continue;
            }
            let Some(expired_at) = c.expired_at else {
                continue;
            };
            if now < expired_at - Duration::days(lead_days) {
                continue;
            }
            let mut state = self.state.lock().await;
            if state.expiry_warned.get(&c.uuid) == Some(&expired_at) {
                continue;
            }
            state.expiry_warned.insert(c.uuid.clone(), expired_at);
            drop(state);

            self.notifier
                .notify(AlertEvent {
                    emoji: "📅".into(),
                    event: "expire.warning".into(),
                    client: c.name.clone(),
                    message: format!(
                        "Expires at {} (auto renewal off).",
                        expired_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    time: now,
                })
                .await;
        }
        Ok(())
    }
}

/// Offline when the window is empty or its newest sample is stale past the
/// grace period.
pub fn is_offline(
    window: &[crate::server::frames::Report],
    now: DateTime<Utc>,
    grace_seconds: i64,
) -> bool {
    match window.last() {
        None => true,
        Some(newest) => newest.updated_at < now - Duration::seconds(grace_seconds),
    }
}

pub fn compare(comparator: &str, value: f64, threshold: f64) -> bool {
    match comparator {
        ">" => value > threshold,
        ">=" => value >= threshold,
        "<" => value < threshold,
        "<=" => value <= threshold,
        _ => false,
    }
}

/// Metric extraction for load rules. `ram` and `disk` compare as a used
/// percentage, `cpu` and `load` as reported, the net metrics as bytes per
/// second.
pub fn metric_value(r: &record::Model, metric: &str) -> f64 {
    fn pct(used: i64, total: i64) -> f64 {
        if total <= 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        }
    }
    match metric {
        "cpu" => r.cpu,
        "ram" => pct(r.ram, r.ram_total),
        "disk" => pct(r.disk, r.disk_total),
        "load" => r.load,
        "net_in" => r.net_in as f64,
        "net_out" => r.net_out as f64,
        _ => 0.0,
    }
}

/// Period-to-date usage per billing mode.
pub fn usage_for(limit_type: &str, up: i64, down: i64) -> i64 {
    match limit_type {
        "max" => up.max(down),
        "min" => up.min(down),
        "up" => up,
        "down" => down,
        _ => up + down,
    }
}

/// Start of the current billing period: the most recent occurrence of the
/// anchor day at midnight UTC. Anchor days are clamped to 28 so every month
/// has one.
pub fn period_start(now: DateTime<Utc>, anchor_day: i64) -> DateTime<Utc> {
    let day = anchor_day.clamp(1, 28) as u32;
    let this_month = Utc
        .with_ymd_and_hms(now.year(), now.month(), day, 0, 0, 0)
        .single();
    match this_month {
        Some(candidate) if candidate <= now => candidate,
        _ => {
            let (year, month) = if now.month() == 1 {
                (now.year() - 1, 12)
            } else {
                (now.year(), now.month() - 1)
            };
            Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
                .single()
                .unwrap_or(now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::frames::Report;

    fn record_with(cpu: f64, ram: i64, ram_total: i64) -> record::Model {
        record::Model {
            client: "u1".into(),
            time: Utc::now(),
            cpu,
            load: 0.0,
            ram,
            ram_total,
            swap: 0,
            swap_total: 0,
            disk: 0,
            disk_total: 0,
            net_in: 0,
            net_out: 0,
            net_total_up: 0,
            net_total_down: 0,
            process: 0,
            connections: 0,
            connections_udp: 0,
            temperature: 0.0,
        }
    }

    #[test]
    fn offline_detection_honors_the_grace_period() {
        let now = Utc::now();
        assert!(is_offline(&[], now, 180));

        let fresh = Report {
            updated_at: now - Duration::seconds(30),
            ..Report::default()
        };
        assert!(!is_offline(std::slice::from_ref(&fresh), now, 180));

        let stale = Report {
            updated_at: now - Duration::seconds(181),
            ..Report::default()
        };
        assert!(is_offline(std::slice::from_ref(&stale), now, 180));
    }

    #[test]
    fn comparators_cover_all_four_operators() {
        assert!(compare(">", 2.0, 1.0));
        assert!(compare(">=", 1.0, 1.0));
        assert!(compare("<", 1.0, 2.0));
        assert!(compare("<=", 2.0, 2.0));
        assert!(!compare("!=", 1.0, 2.0));
    }

    #[test]
    fn metric_values_use_percentages_for_capacity_metrics() {
        let r = record_with(55.0, 2000, 4000);
        assert_eq!(metric_value(&r, "cpu"), 55.0);
        assert_eq!(metric_value(&r, "ram"), 50.0);
        assert_eq!(metric_value(&r, "disk"), 0.0);
        assert_eq!(metric_value(&r, "unknown"), 0.0);
    }

    #[test]
    fn traffic_usage_modes() {
        assert_eq!(usage_for("sum", 10, 20), 30);
        assert_eq!(usage_for("max", 10, 20), 20);
        assert_eq!(usage_for("min", 10, 20), 10);
        assert_eq!(usage_for("up", 10, 20), 10);
        assert_eq!(usage_for("down", 10, 20), 20);
    }

    #[test]
    fn period_start_rolls_back_to_the_previous_month() {
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();
        assert_eq!(
            period_start(now, 1),
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            period_start(now, 15),
            Utc.with_ymd_and_hms(2025, 5, 15, 0, 0, 0).unwrap()
        );
        // January rolls into the previous year.
        let jan = Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(
            period_start(jan, 20),
            Utc.with_ymd_and_hms(2024, 12, 20, 0, 0, 0).unwrap()
        );
        // Anchor day 31 clamps to 28.
        assert_eq!(
            period_start(now, 31),
            Utc.with_ymd_and_hms(2025, 5, 28, 0, 0, 0).unwrap()
        );
    }
}
