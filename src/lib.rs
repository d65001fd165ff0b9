//! Komari: self-hosted fleet monitoring server.
//!
//! Agents push telemetry over persistent channels; the server aggregates it
//! into minute records, schedules latency probes, evaluates alert rules and
//! serves an HTTP/JSON-RPC API for operators.

pub mod alerting;
pub mod config;
pub mod db;
pub mod event;
pub mod notifications;
pub mod pipeline;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod utils;
pub mod version;
pub mod web;
