//! Process-wide configuration.
//!
//! A typed [`Config`] is loaded from a JSON file at startup and kept behind
//! an atomically swapped `Arc`; readers grab a cheap snapshot, writers build
//! a new value, persist it and publish the swap together with a
//! `config.updated` event. Partial updates are deep-merged over the current
//! value; `null` values in a patch leave the existing key untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventBus};

pub const DEFAULT_CONFIG_PATH: &str = "./data/komari.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Site {
    pub sitename: String,
    pub description: String,
    pub allow_cors: bool,
    pub theme: String,
    pub private_site: bool,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            sitename: "Komari".into(),
            description: "Komari Monitor, a simple server monitoring tool.".into(),
            allow_cors: false,
            theme: "default".into(),
            private_site: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    pub api_key: String,
    pub auto_discovery_key: String,
    pub disable_password_login: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIp {
    pub enabled: bool,
    pub provider: String,
}

impl Default for GeoIp {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "ipinfo".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    pub enabled: bool,
    /// Name of the sink instance; `none` disables outgoing messages.
    pub method: String,
    pub traffic_limit_percentage: f64,
    pub expire_notification_lead_days: i64,
    pub template: String,
    pub webhook_url: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
}

impl Default for Notification {
    fn default() -> Self {
        Self {
            enabled: true,
            method: "none".into(),
            traffic_limit_percentage: 80.0,
            expire_notification_lead_days: 7,
            template: "{{emoji}} {{event}}\nClient: {{client}}\n{{message}}\nTime: {{time}}"
                .into(),
            webhook_url: String::new(),
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub enabled: bool,
    /// Hours a minute-resolution record is kept.
    pub record_preserve_time: i64,
    /// Hours a ping record is kept.
    pub ping_record_preserve_time: i64,
    /// Hours an audit log row is kept.
    pub audit_preserve_time: i64,
    /// Hours after which records are downsampled into the long-term table.
    /// Zero means `record_preserve_time / 4`.
    pub compaction_threshold: i64,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            enabled: true,
            record_preserve_time: 720,
            ping_record_preserve_time: 24,
            audit_preserve_time: 2160,
            compaction_threshold: 0,
        }
    }
}

impl Record {
    pub fn effective_compaction_threshold(&self) -> i64 {
        if self.compaction_threshold > 0 {
            self.compaction_threshold
        } else {
            self.record_preserve_time / 4
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    /// `sqlite` or `mysql`.
    pub driver: String,
    /// SQLite database file, used when driver is `sqlite`.
    pub file: String,
    /// Full DSN, used when driver is `mysql`.
    pub dsn: String,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            driver: "sqlite".into(),
            file: "./data/komari.db".into(),
            dsn: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub site: Site,
    pub login: Login,
    pub geo_ip: GeoIp,
    pub notification: Notification,
    pub record: Record,
    pub database: Database,
    /// Open section for extension settings; preserved verbatim.
    pub extensions: serde_json::Map<String, Value>,
}

impl Config {
    pub fn connection_url(&self) -> String {
        if self.database.driver == "mysql" {
            self.database.dsn.clone()
        } else {
            format!("sqlite://{}?mode=rwc", self.database.file)
        }
    }
}

/// Deep-merges `patch` into `base`. Objects merge key-wise, anything else is
/// replaced. `null` values in the patch are skipped so a partial update can
/// never delete a key.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && patch_value.is_object() => {
                        deep_merge(base_value, patch_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base, patch) => {
            if !patch.is_null() {
                *base = patch.clone();
            }
        }
    }
}

/// Shared handle to the live configuration.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    bus: Arc<EventBus>,
}

impl ConfigStore {
    /// Load the config file, creating it with defaults when absent, and
    /// announce the initial value on the bus.
    pub async fn open(path: impl AsRef<Path>, bus: Arc<EventBus>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice::<Config>(&bytes)?
        } else {
            let default = Config::default();
            persist(&path, &default)?;
            default
        };

        let store = Self {
            path,
            current: RwLock::new(Arc::new(config.clone())),
            bus,
        };
        store
            .bus
            .trigger_async(Event::ConfigUpdated {
                old: Arc::new(Config::default()),
                new: Arc::new(config),
            });
        Ok(store)
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Replace the whole configuration: persist, swap, announce.
    pub fn save_full(&self, new: Config) -> Result<(), ConfigError> {
        persist(&self.path, &new)?;
        let new = Arc::new(new);
        let old = {
            let mut guard = self.current.write();
            std::mem::replace(&mut *guard, new.clone())
        };
        self.bus.trigger_async(Event::ConfigUpdated { old, new });
        Ok(())
    }

    /// Deep-merge a JSON patch over the current configuration and persist
    /// the result.
    pub fn save_partial(&self, patch: Value) -> Result<(), ConfigError> {
        let mut base = serde_json::to_value(self.get().as_ref())?;
        deep_merge(&mut base, &patch);
        let merged: Config = serde_json::from_value(base)?;
        self.save_full(merged)
    }
}

fn persist(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(config)?;
    std::fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_round_trips_through_json() {
        let mut config = Config::default();
        config.site.sitename = "fleet".into();
        config.record.record_preserve_time = 168;
        config
            .extensions
            .insert("nezha".into(), json!({"enabled": true}));

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn partial_merge_overrides_only_named_keys() {
        let mut base = serde_json::to_value(Config::default()).unwrap();
        deep_merge(&mut base, &json!({"site": {"sitename": "edge"}}));
        let merged: Config = serde_json::from_value(base).unwrap();

        assert_eq!(merged.site.sitename, "edge");
        assert_eq!(merged.site.theme, "default");
        assert_eq!(merged.record.record_preserve_time, 720);
    }

    #[test]
    fn null_patch_values_do_not_delete_keys() {
        let mut base = json!({"site": {"sitename": "Komari", "theme": "default"}});
        deep_merge(&mut base, &json!({"site": {"sitename": null, "theme": "dark"}}));
        assert_eq!(base["site"]["sitename"], "Komari");
        assert_eq!(base["site"]["theme"], "dark");
    }

    #[test]
    fn compaction_threshold_defaults_to_quarter_of_preserve_time() {
        let record = Record::default();
        assert_eq!(record.effective_compaction_threshold(), 180);

        let pinned = Record {
            compaction_threshold: 48,
            ..Record::default()
        };
        assert_eq!(pinned.effective_compaction_threshold(), 48);
    }

    #[tokio::test]
    async fn store_creates_missing_file_and_saves_partials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("komari.json");
        let bus = EventBus::new();

        let store = ConfigStore::open(&path, bus).await.unwrap();
        assert!(path.exists());

        store
            .save_partial(json!({"record": {"ping_record_preserve_time": 72}}))
            .unwrap();
        assert_eq!(store.get().record.ping_record_preserve_time, 72);

        let reloaded: Config =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded.record.ping_record_preserve_time, 72);
        assert_eq!(reloaded.site.sitename, "Komari");
    }
}
