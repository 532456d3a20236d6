//! Gateway configuration: broker connection parameters, the ConfigStore
//! database path, and the logs directory. Loaded from a JSON file under
//! `~/.edge-gateway/` the same way the teacher's `Config::init` discovers
//! its storage directory via `dirs::home_dir()`, generalized to the
//! gateway's own settings instead of SSH alias bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Generic save/load behavior for any JSON-serializable config object,
/// mirroring the teacher's `StorageObject` trait (`app.rs`).
pub trait StorageObject: Serialize + for<'de> Deserialize<'de> + Sized {
    fn save_to(&self, path: impl AsRef<Path>) {
        if let Some(parent) = path.as_ref().parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    tracing::warn!(path = %path.as_ref().display(), error = %e, "failed to write config");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize config"),
        }
    }

    fn read_from(path: impl AsRef<Path>) -> Self
    where
        Self: Default,
    {
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.as_ref().display(), error = %e, "malformed config, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_broker_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Seconds to wait between reconnect attempts after a broker error.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_broker_port() -> u16 {
    5672
}
fn default_broker_user() -> String {
    "guest".to_string()
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_heartbeat_secs() -> u16 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: default_broker_host(),
            port: default_broker_port(),
            user: default_broker_user(),
            password: String::new(),
            retry_delay_secs: default_retry_delay_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI for this configuration. `heartbeat` is carried as the
    /// standard URI query parameter so the broker negotiates it during the
    /// connection handshake rather than needing a separate lapin call.
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f?heartbeat={}",
            self.user, self.password, self.host, self.port, self.heartbeat_secs
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl Default for Config {
    fn default() -> Self {
        let storage_dir = default_storage_dir();
        Config {
            db_path: storage_dir.join("gateway.db"),
            logs_dir: storage_dir.join("logs"),
            broker: BrokerConfig::default(),
        }
    }
}

impl StorageObject for Config {}

fn default_storage_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".edge-gateway"),
        None => PathBuf::from(".edge-gateway"),
    }
}

fn default_config_path() -> PathBuf {
    default_storage_dir().join("config.json")
}

impl Config {
    /// Loads configuration from `config_path` (or the default
    /// `~/.edge-gateway/config.json`), writing defaults to disk on first
    /// run, then applies CLI overrides for `--db`.
    pub fn load(config_path: Option<PathBuf>, db_override: Option<PathBuf>) -> Self {
        let path = config_path.unwrap_or_else(default_config_path);
        let mut config = if path.exists() {
            Config::read_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path);
            config
        };
        if let Some(db) = db_override {
            config.db_path = db;
        }
        config
    }
}
