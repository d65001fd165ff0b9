//! Agent wire schema.
//!
//! Frames are JSON objects tagged by `type`, multiplexed on the persistent
//! agent channel. Unknown fields land in the `extensions` map so older
//! servers stay compatible with newer agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One instantaneous GPU sample inside a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub utilization: f64,
    #[serde(default)]
    pub mem_used: i64,
    #[serde(default)]
    pub mem_total: i64,
    #[serde(default)]
    pub temperature: f64,
}

/// One instantaneous telemetry sample submitted by an agent. Retained in
/// memory for at most 60 seconds per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Report {
    pub uptime: i64,
    pub load: f64,
    pub cpu: f64,
    pub ram: i64,
    pub ram_total: i64,
    pub swap: i64,
    pub swap_total: i64,
    pub disk: i64,
    pub disk_total: i64,
    /// Instantaneous bytes per second.
    pub net_in: i64,
    pub net_out: i64,
    /// Monotonic counters since agent boot.
    pub net_total_up: i64,
    pub net_total_down: i64,
    pub process: i64,
    pub connections: i64,
    pub connections_udp: i64,
    pub temperature: Option<f64>,
    pub gpu: Vec<GpuSample>,
    /// Stamped by the server at intake.
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Default for Report {
    fn default() -> Self {
        Self {
            uptime: 0,
            load: 0.0,
            cpu: 0.0,
            ram: 0,
            ram_total: 0,
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
            temperature: None,
            gpu: Vec::new(),
            updated_at: Utc::now(),
            extensions: Map::new(),
        }
    }
}

/// Host metadata the agent uploads once per boot or on change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicInfo {
    pub ipv4: String,
    pub ipv6: String,
    pub os: String,
    pub arch: String,
    pub cpu_name: String,
    pub cpu_cores: i64,
    pub virtualization: String,
    pub mem_total: i64,
    pub swap_total: i64,
    pub disk_total: i64,
    pub gpu_name: String,
    pub version: String,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// Probe flavor of a ping task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingKind {
    Icmp,
    Tcp,
    Http,
}

impl PingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PingKind::Icmp => "icmp",
            PingKind::Tcp => "tcp",
            PingKind::Http => "http",
        }
    }
}

impl std::str::FromStr for PingKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icmp" => Ok(PingKind::Icmp),
            "tcp" => Ok(PingKind::Tcp),
            "http" => Ok(PingKind::Http),
            _ => Err(()),
        }
    }
}

/// Observation frames, agent to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// First frame of a connection whose upgrade URL carried no token.
    Auth {
        token: String,
    },
    BasicInfo(BasicInfo),
    Report(Report),
    TaskResult {
        task_id: String,
        result: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        finished_at: Option<DateTime<Utc>>,
    },
    PingResult {
        task_id: i64,
        /// Milliseconds, or -1 for loss measured agent-side.
        value: i32,
    },
    TerminalData {
        session: String,
        data: String,
    },
}

/// Command frames, server to agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    PingProbe {
        task_id: i64,
        probe: PingKind,
        target: String,
    },
    ExecTask {
        task_id: String,
        command: String,
    },
    TerminalOpen {
        session: String,
    },
    TerminalClose {
        session: String,
    },
    TerminalData {
        session: String,
        data: String,
    },
    ReloadConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_frame_parses_with_unknown_fields() {
        let raw = r#"{
            "type": "report",
            "cpu": 42.5,
            "ram": 1000,
            "ram_total": 4000,
            "net_total_up": 123,
            "gpu": [{"index": 0, "utilization": 55.0, "mem_used": 10, "mem_total": 100}],
            "some_future_field": {"nested": true}
        }"#;
        let frame: AgentFrame = serde_json::from_str(raw).unwrap();
        match frame {
            AgentFrame::Report(report) => {
                assert_eq!(report.cpu, 42.5);
                assert_eq!(report.ram_total, 4000);
                assert_eq!(report.gpu.len(), 1);
                assert!(report.extensions.contains_key("some_future_field"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ping_probe_serializes_with_lowercase_kind() {
        let frame = ServerFrame::PingProbe {
            task_id: 7,
            probe: PingKind::Tcp,
            target: "203.0.113.9:443".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "ping_probe");
        assert_eq!(value["probe"], "tcp");
        assert_eq!(value["task_id"], 7);
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let raw = r#"{"type": "flux_capacitor", "value": 1}"#;
        assert!(serde_json::from_str::<AgentFrame>(raw).is_err());
    }
}
