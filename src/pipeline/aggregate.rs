//! Burst-to-minute EWMA aggregation.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use sea_orm::Set;

use crate::db::entities::{gpu_record, record};
use crate::server::frames::{GpuSample, Report};

/// Smoothing factor. Samples fold oldest to newest with
/// `acc = ALPHA * acc + (1 - ALPHA) * sample`, so the newest sample carries
/// the highest weight.
pub const ALPHA: f64 = 0.3;

/// EWMA over values ordered oldest to newest.
pub fn ewma(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut iter = values.into_iter();
    let Some(first) = iter.next() else {
        return 0.0;
    };
    iter.fold(first, |acc, value| ALPHA * acc + (1.0 - ALPHA) * value)
}

fn ewma_int(values: impl IntoIterator<Item = i64>) -> i64 {
    ewma(values.into_iter().map(|v| v as f64)).round() as i64
}

/// Truncate an instant to its minute.
pub fn minute_of(instant: DateTime<Utc>) -> DateTime<Utc> {
    let ts = instant.timestamp();
    match Utc.timestamp_opt(ts - ts.rem_euclid(60), 0) {
        chrono::LocalResult::Single(t) => t,
        _ => instant,
    }
}

/// Truncate an instant to a bucket of `seconds`.
pub fn bucket_of(instant: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    let ts = instant.timestamp();
    match Utc.timestamp_opt(ts - ts.rem_euclid(seconds), 0) {
        chrono::LocalResult::Single(t) => t,
        _ => instant,
    }
}

/// Flatten one client's report window into a single Record row. Gauges are
/// EWMA-smoothed; the monotonic transfer counters take the newest sample so
/// traffic deltas stay exact.
pub fn aggregate_reports(
    uuid: &str,
    samples: &[Report],
    minute: DateTime<Utc>,
) -> record::ActiveModel {
    let mut ordered: Vec<&Report> = samples.iter().collect();
    ordered.sort_by_key(|r| r.updated_at);
    let newest = ordered.last().copied();

    record::ActiveModel {
        client: Set(uuid.to_owned()),
        time: Set(minute),
        cpu: Set(ewma(ordered.iter().map(|r| r.cpu))),
        load: Set(ewma(ordered.iter().map(|r| r.load))),
        ram: Set(ewma_int(ordered.iter().map(|r| r.ram))),
        ram_total: Set(newest.map(|r| r.ram_total).unwrap_or_default()),
        swap: Set(ewma_int(ordered.iter().map(|r| r.swap))),
        swap_total: Set(newest.map(|r| r.swap_total).unwrap_or_default()),
        disk: Set(ewma_int(ordered.iter().map(|r| r.disk))),
        disk_total: Set(newest.map(|r| r.disk_total).unwrap_or_default()),
        net_in: Set(ewma_int(ordered.iter().map(|r| r.net_in))),
        net_out: Set(ewma_int(ordered.iter().map(|r| r.net_out))),
        net_total_up: Set(newest.map(|r| r.net_total_up).unwrap_or_default()),
        net_total_down: Set(newest.map(|r| r.net_total_down).unwrap_or_default()),
        process: Set(ewma_int(ordered.iter().map(|r| r.process))),
        connections: Set(ewma_int(ordered.iter().map(|r| r.connections))),
        connections_udp: Set(ewma_int(ordered.iter().map(|r| r.connections_udp))),
        temperature: Set(ewma(
            ordered.iter().filter_map(|r| r.temperature),
        )),
    }
}

/// Aggregate GPU samples per `(device_index)` the same way.
pub fn aggregate_gpu_samples(
    uuid: &str,
    samples: &[Report],
    minute: DateTime<Utc>,
) -> Vec<gpu_record::ActiveModel> {
    let mut ordered: Vec<&Report> = samples.iter().collect();
    ordered.sort_by_key(|r| r.updated_at);

    let mut per_device: BTreeMap<i64, Vec<&GpuSample>> = BTreeMap::new();
    for report in &ordered {
        for sample in &report.gpu {
            per_device.entry(sample.index).or_default().push(sample);
        }
    }

    per_device
        .into_iter()
        .map(|(index, samples)| {
            let newest = samples.last();
            gpu_record::ActiveModel {
                client: Set(uuid.to_owned()),
                device_index: Set(index),
                time: Set(minute),
                name: Set(newest.map(|s| s.name.clone()).unwrap_or_default()),
                utilization: Set(ewma(samples.iter().map(|s| s.utilization))),
                mem_used: Set(ewma_int(samples.iter().map(|s| s.mem_used))),
                mem_total: Set(newest.map(|s| s.mem_total).unwrap_or_default()),
                temperature: Set(ewma(samples.iter().map(|s| s.temperature))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sea_orm::ActiveValue;

    fn unwrap<T: Clone>(value: &ActiveValue<T>) -> T
    where
        T: Into<sea_orm::Value>,
    {
        match value {
            ActiveValue::Set(v) => v.clone(),
            _ => panic!("expected Set value"),
        }
    }

    #[test]
    fn ewma_weights_the_newest_sample_highest() {
        // Two samples: 42.5 then 57.5 -> 0.3 * 42.5 + 0.7 * 57.5 = 53.0,
        // inside the expected 50 +/- 3 band for the spread aggregation.
        let value = ewma([42.5, 57.5]);
        assert!((value - 53.0).abs() < 1e-9);
        assert!((value - 50.0).abs() <= 3.0);
    }

    #[test]
    fn ewma_of_a_single_sample_is_the_sample() {
        assert_eq!(ewma([7.25]), 7.25);
        assert_eq!(ewma(std::iter::empty::<f64>()), 0.0);
    }

    #[test]
    fn minute_truncation_drops_seconds() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 10, 4, 59).unwrap();
        assert_eq!(minute_of(t), Utc.with_ymd_and_hms(2025, 6, 1, 10, 4, 0).unwrap());
    }

    #[test]
    fn bucket_truncation_aligns_to_fifteen_minutes() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 10, 17, 30).unwrap();
        assert_eq!(
            bucket_of(t, 900),
            Utc.with_ymd_and_hms(2025, 6, 1, 10, 15, 0).unwrap()
        );
    }

    #[test]
    fn aggregation_smooths_gauges_and_pins_counters() {
        let base = Utc::now();
        let samples = vec![
            Report {
                cpu: 42.5,
                ram: 1000,
                ram_total: 4000,
                net_total_up: 100,
                updated_at: base - Duration::seconds(45),
                ..Report::default()
            },
            Report {
                cpu: 57.5,
                ram: 2000,
                ram_total: 4000,
                net_total_up: 250,
                updated_at: base - Duration::seconds(15),
                ..Report::default()
            },
        ];

        let row = aggregate_reports("u1", &samples, minute_of(base));
        let cpu = unwrap(&row.cpu);
        assert!((cpu - 53.0).abs() < 1e-9);
        assert_eq!(unwrap(&row.ram_total), 4000);
        // Counter takes the newest sample, not a smoothed value.
        assert_eq!(unwrap(&row.net_total_up), 250);
    }

    #[test]
    fn gpu_samples_group_by_device_index() {
        let base = Utc::now();
        let report = |util0: f64, util1: f64, age: i64| Report {
            gpu: vec![
                GpuSample {
                    index: 0,
                    name: "A100".into(),
                    utilization: util0,
                    mem_used: 10,
                    mem_total: 80,
                    temperature: 60.0,
                },
                GpuSample {
                    index: 1,
                    name: "A100".into(),
                    utilization: util1,
                    mem_used: 20,
                    mem_total: 80,
                    temperature: 65.0,
                },
            ],
            updated_at: base - Duration::seconds(age),
            ..Report::default()
        };

        let rows = aggregate_gpu_samples("u1", &[report(10.0, 90.0, 30), report(20.0, 80.0, 10)], minute_of(base));
        assert_eq!(rows.len(), 2);
        assert_eq!(unwrap(&rows[0].device_index), 0);
        assert_eq!(unwrap(&rows[1].device_index), 1);
        let util0 = unwrap(&rows[0].utilization);
        assert!((util0 - (0.3 * 10.0 + 0.7 * 20.0)).abs() < 1e-9);
    }
}
