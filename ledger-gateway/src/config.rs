//! Configuration for the gateway

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Ledger network connection
    pub network: NetworkConfig,

    /// Submission tracking
    pub tracker: TrackerConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/gateway"),
            service_name: "ledger-gateway".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            network: NetworkConfig::default(),
            tracker: TrackerConfig::default(),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// Ledger network connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// WebSocket URLs of the ledger servers, tried in order
    pub servers: Vec<String>,

    /// Full rounds over `servers` allowed at startup before giving up
    pub startup_retry_budget: u32,

    /// First reconnect delay (milliseconds)
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap (milliseconds)
    pub max_backoff_ms: u64,

    /// Backoff growth factor
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the delay
    pub jitter_factor: f64,

    /// Largest gap that is backfilled before giving up on it
    pub max_backfill_ledgers: u64,

    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,

    /// Dispatcher mailbox capacity
    pub mailbox_capacity: usize,

    /// Lifecycle event broadcast capacity
    pub event_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            servers: vec!["wss://s1.ripple.com:443".to_string()],
            startup_retry_budget: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,     // 30 seconds
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,         // 10% jitter
            max_backfill_ledgers: 256,
            request_timeout_secs: 10,
            mailbox_capacity: 1000,
            event_capacity: 256,
        }
    }
}

/// Submission tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Ledger closes a transaction may stay unresolved before it expires
    pub expiry_ledgers: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { expiry_ledgers: 20 }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Fsync pending-transaction writes before acknowledging them
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("GATEWAY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(servers) = std::env::var("GATEWAY_SERVERS") {
            config.network.servers = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(expiry) = std::env::var("GATEWAY_EXPIRY_LEDGERS") {
            config.tracker.expiry_ledgers = expiry.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid GATEWAY_EXPIRY_LEDGERS '{}': {}", expiry, e))
            })?;
        }

        if let Ok(budget) = std::env::var("GATEWAY_STARTUP_RETRY_BUDGET") {
            config.network.startup_retry_budget = budget.parse().map_err(|e| {
                crate::Error::Config(format!(
                    "Invalid GATEWAY_STARTUP_RETRY_BUDGET '{}': {}",
                    budget, e
                ))
            })?;
        }

        Ok(config)
    }

    /// Check values that would make the gateway unable to start
    pub fn validate(&self) -> crate::Result<()> {
        if self.network.servers.is_empty() {
            return Err(crate::Error::Config("No ledger servers configured".to_string()));
        }

        for server in &self.network.servers {
            if !(server.starts_with("ws://") || server.starts_with("wss://")) {
                return Err(crate::Error::Config(format!(
                    "Server URL must use ws:// or wss://: {}",
                    server
                )));
            }
        }

        if self.tracker.expiry_ledgers == 0 {
            return Err(crate::Error::Config(
                "tracker.expiry_ledgers must be at least 1".to_string(),
            ));
        }

        if self.network.mailbox_capacity == 0 || self.network.event_capacity == 0 {
            return Err(crate::Error::Config(
                "Channel capacities must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
