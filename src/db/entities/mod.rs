pub mod audit_log;
pub mod client;
pub mod clipboard;
pub mod gpu_record;
pub mod gpu_record_long_term;
pub mod load_notification;
pub mod offline_notification;
pub mod oidc_provider;
pub mod ping_record;
pub mod ping_task;
pub mod record;
pub mod record_long_term;
pub mod schema_version;
pub mod session;
pub mod task;
pub mod task_result;
pub mod user;
