//! Downsampling of aged hot rows into the long-term tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sea_orm::Set;

use super::aggregate::{bucket_of, ewma};
use crate::db::entities::{gpu_record, gpu_record_long_term, record, record_long_term};

/// Long-term cadence: one row per 15 minutes, shared by load and GPU rows.
const BUCKET_SECONDS: i64 = 900;

fn ewma_int(values: impl IntoIterator<Item = i64>) -> i64 {
    ewma(values.into_iter().map(|v| v as f64)).round() as i64
}

/// Collapse minute rows into 15-minute buckets per client. Rows are assumed
/// ordered by `(client, time)`; within a bucket the same EWMA as the minute
/// aggregation applies and counters take the newest row.
pub fn downsample_records(rows: &[record::Model]) -> Vec<record_long_term::ActiveModel> {
    let mut buckets: BTreeMap<(String, DateTime<Utc>), Vec<&record::Model>> = BTreeMap::new();
    for row in rows {
        buckets
            .entry((row.client.clone(), bucket_of(row.time, BUCKET_SECONDS)))
            .or_default()
            .push(row);
    }

    buckets
        .into_iter()
        .map(|((client, bucket), mut rows)| {
            rows.sort_by_key(|r| r.time);
            let newest = rows[rows.len() - 1];
            record_long_term::ActiveModel {
                client: Set(client),
                time: Set(bucket),
                cpu: Set(ewma(rows.iter().map(|r| r.cpu))),
                load: Set(ewma(rows.iter().map(|r| r.load))),
                ram: Set(ewma_int(rows.iter().map(|r| r.ram))),
                ram_total: Set(newest.ram_total),
                swap: Set(ewma_int(rows.iter().map(|r| r.swap))),
                swap_total: Set(newest.swap_total),
                disk: Set(ewma_int(rows.iter().map(|r| r.disk))),
                disk_total: Set(newest.disk_total),
                net_in: Set(ewma_int(rows.iter().map(|r| r.net_in))),
                net_out: Set(ewma_int(rows.iter().map(|r| r.net_out))),
                net_total_up: Set(newest.net_total_up),
                net_total_down: Set(newest.net_total_down),
                process: Set(ewma_int(rows.iter().map(|r| r.process))),
                connections: Set(ewma_int(rows.iter().map(|r| r.connections))),
                connections_udp: Set(ewma_int(rows.iter().map(|r| r.connections_udp))),
                temperature: Set(ewma(rows.iter().map(|r| r.temperature))),
            }
        })
        .collect()
}

/// GPU rows bucket per `(client, device_index)` on the same cadence.
pub fn downsample_gpu_records(
    rows: &[gpu_record::Model],
) -> Vec<gpu_record_long_term::ActiveModel> {
    let mut buckets: BTreeMap<(String, i64, DateTime<Utc>), Vec<&gpu_record::Model>> =
        BTreeMap::new();
    for row in rows {
        buckets
            .entry((
                row.client.clone(),
                row.device_index,
                bucket_of(row.time, BUCKET_SECONDS),
            ))
            .or_default()
            .push(row);
    }

    buckets
        .into_iter()
        .map(|((client, device_index, bucket), mut rows)| {
            rows.sort_by_key(|r| r.time);
            let newest = rows[rows.len() - 1];
            gpu_record_long_term::ActiveModel {
                client: Set(client),
                device_index: Set(device_index),
                time: Set(bucket),
                name: Set(newest.name.clone()),
                utilization: Set(ewma(rows.iter().map(|r| r.utilization))),
                mem_used: Set(ewma_int(rows.iter().map(|r| r.mem_used))),
                mem_total: Set(newest.mem_total),
                temperature: Set(ewma(rows.iter().map(|r| r.temperature))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sea_orm::ActiveValue;

    fn minute_row(client: &str, minute: u32, cpu: f64) -> record::Model {
        record::Model {
            client: client.to_owned(),
            time: Utc.with_ymd_and_hms(2025, 6, 1, 3, minute, 0).unwrap(),
            cpu,
            load: 0.0,
            ram: 0,
            ram_total: 0,
            swap: 0,
            swap_total: 0,
            disk: 0,
            disk_total: 0,
            net_in: 0,
            net_out: 0,
            net_total_up: i64::from(minute),
            net_total_down: 0,
            process: 0,
            connections: 0,
            connections_udp: 0,
            temperature: 0.0,
        }
    }

    fn set_value<T: Clone>(value: &ActiveValue<T>) -> T
    where
        T: Into<sea_orm::Value>,
    {
        match value {
            ActiveValue::Set(v) => v.clone(),
            _ => panic!("expected Set value"),
        }
    }

    #[test]
    fn minute_rows_collapse_into_fifteen_minute_buckets() {
        let rows = vec![
            minute_row("u1", 0, 10.0),
            minute_row("u1", 7, 20.0),
            minute_row("u1", 14, 30.0),
            minute_row("u1", 15, 99.0),
            minute_row("u2", 3, 50.0),
        ];

        let out = downsample_records(&rows);
        assert_eq!(out.len(), 3);

        let first = &out[0];
        assert_eq!(
            set_value(&first.time),
            Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap()
        );
        // Counter pins to the newest row of the bucket (minute 14).
        assert_eq!(set_value(&first.net_total_up), 14);

        assert_eq!(set_value(&out[1].client), "u1");
        assert_eq!(
            set_value(&out[1].time),
            Utc.with_ymd_and_hms(2025, 6, 1, 3, 15, 0).unwrap()
        );
    }
}
