//! Configuration system for tasknet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TASKNET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tasknet/config.toml
//!   3. ~/.config/tasknet/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TasknetConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub concent: ConcentConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to Ed25519 keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
    /// Name advertised in `Hello` and `NodeInfo`.
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the protocol listener binds to.
    pub bind_addr: String,
    /// TCP port for peer sessions. 0 = OS-assigned.
    pub listen_port: u16,
    /// Address advertised to peers. Empty = not reachable.
    pub public_addr: String,
    /// Status API port on localhost.
    pub api_port: u16,
    /// Peers to connect to at startup, "host:port".
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Minimum leading zero bits in BLAKE3(peer key). Also the difficulty
    /// our own key is generated with.
    pub key_difficulty: u32,
    /// Highest subtask price a requestor accepts from a provider.
    pub max_price: u64,
    /// Largest input resources a provider agrees to fetch, bytes.
    pub max_resource_size: u64,
    /// Memory a provider offers per subtask, bytes.
    pub max_memory_size: u64,
    /// Grace period added to a subtask deadline before a report is late.
    pub deadline_slack_secs: u64,
    /// Price per subtask a provider asks in its offers.
    pub offer_price: u64,
    /// Benchmark score a provider advertises in its offers.
    pub perf_index: f64,
}

/// Arbiter ("concent") settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcentConfig {
    pub enabled: bool,
    /// Delay before the requestor asks the arbiter to fetch results.
    pub force_get_result_delay_secs: u64,
    /// Delay before the provider escalates an unacknowledged report.
    pub force_report_delay_secs: u64,
    /// Delay before the provider escalates a missing accept/reject.
    pub force_results_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Mirror message history into SQLite.
    pub persist: bool,
    pub db_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
            node_name: "tasknet-node".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            listen_port: 40102,
            public_addr: String::new(),
            api_port: 9001,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            key_difficulty: 4,
            max_price: 100,
            max_resource_size: 2 * 1024 * 1024 * 1024, // 2 GB
            max_memory_size: 1024 * 1024 * 1024,       // 1 GB
            deadline_slack_secs: 0,
            offer_price: 30,
            perf_index: 1000.0,
        }
    }
}

impl Default for ConcentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            force_get_result_delay_secs: 300,
            force_report_delay_secs: 300,
            force_results_delay_secs: 600,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            persist: true,
            db_path: data_dir().join("history.db"),
        }
    }
}

impl ConcentConfig {
    pub fn force_get_result_delay(&self) -> Duration {
        Duration::from_secs(self.force_get_result_delay_secs)
    }

    pub fn force_report_delay(&self) -> Duration {
        Duration::from_secs(self.force_report_delay_secs)
    }

    pub fn force_results_delay(&self) -> Duration {
        Duration::from_secs(self.force_results_delay_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tasknet")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tasknet")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TasknetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            TasknetConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TASKNET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TasknetConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TASKNET_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("TASKNET_IDENTITY__NODE_NAME") {
            self.identity.node_name = v;
        }
        if let Some(p) = lookup("TASKNET_NETWORK__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.network.listen_port = p;
        }
        if let Some(p) = lookup("TASKNET_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = lookup("TASKNET_NETWORK__PUBLIC_ADDR") {
            self.network.public_addr = v;
        }
        if let Some(d) = lookup("TASKNET_PROTOCOL__KEY_DIFFICULTY").and_then(|v| v.parse().ok()) {
            self.protocol.key_difficulty = d;
        }
        if let Some(p) = lookup("TASKNET_PROTOCOL__MAX_PRICE").and_then(|v| v.parse().ok()) {
            self.protocol.max_price = p;
        }
        if let Some(p) = lookup("TASKNET_PROTOCOL__OFFER_PRICE").and_then(|v| v.parse().ok()) {
            self.protocol.offer_price = p;
        }
        if let Some(v) = lookup("TASKNET_CONCENT__ENABLED") {
            self.concent.enabled = flag(v);
        }
        if let Some(v) = lookup("TASKNET_HISTORY__PERSIST") {
            self.history.persist = flag(v);
        }
        if let Some(v) = lookup("TASKNET_HISTORY__DB_PATH") {
            self.history.db_path = PathBuf::from(v);
        }
    }
}
