//! xsitepush Configuration
//!
//! This module provides configuration structures for a node taking part in
//! cross-site state transfer: its own identity, the local cluster view, and
//! the remote sites it backs up to.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::state::XSiteStateTransferMode;

/// Main xsitepush configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XSiteConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Local cluster configuration
    pub cluster: ClusterConfig,

    /// Remote sites this cache backs up to
    #[serde(default)]
    pub backups: Vec<BackupConfig>,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, used as the node's cluster address
    pub id: String,

    /// Address to bind for cluster and cross-site communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Name of the site this node belongs to
    pub site: String,
}

/// A member of the initial cluster view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Node identifier
    pub id: String,
    /// host:port the node listens on
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Initial members, in view order (the first one is the coordinator)
    #[serde(default)]
    pub members: Vec<MemberConfig>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Time without heartbeats after which a member is removed from the view
    #[serde(default = "default_failure_timeout_ms")]
    pub failure_timeout_ms: u64,

    /// Number of data segments keys are partitioned into
    #[serde(default = "default_num_segments")]
    pub num_segments: usize,
}

/// How a backup site receives writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStrategy {
    /// Each chunk is acknowledged by the remote site before the next one is sent
    Sync,
    /// Chunks are handed to conflict tracking and delivered eventually
    Async,
}

/// A remote backup site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Remote site name
    pub site: String,

    /// Address of the remote site's entry node
    pub address: String,

    /// Backup strategy
    #[serde(default = "default_strategy")]
    pub strategy: BackupStrategy,

    /// Per-chunk remote send timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of entries per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Retries per chunk after the first failed attempt (sync only)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retries in milliseconds (0 = retry immediately)
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,

    /// Automatic state transfer mode
    #[serde(default)]
    pub mode: XSiteStateTransferMode,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_failure_timeout_ms() -> u64 {
    3000
}

fn default_num_segments() -> usize {
    256
}

fn default_strategy() -> BackupStrategy {
    BackupStrategy::Async
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_chunk_size() -> usize {
    512
}

fn default_max_retries() -> u32 {
    30
}

fn default_wait_time_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl BackupConfig {
    /// Create a backup entry with default transfer settings
    pub fn new(site: impl Into<String>, address: impl Into<String>, strategy: BackupStrategy) -> Self {
        Self {
            site: site.into(),
            address: address.into(),
            strategy,
            timeout_ms: default_timeout_ms(),
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            wait_time_ms: default_wait_time_ms(),
            mode: XSiteStateTransferMode::default(),
        }
    }

    /// Whether chunks are acknowledged synchronously
    pub fn is_sync(&self) -> bool {
        self.strategy == BackupStrategy::Sync
    }

    /// Per-chunk send timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay between retries
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

impl XSiteConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: XSiteConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.node.site.is_empty() {
            return Err(crate::Error::Config("node.site cannot be empty".into()));
        }

        if self.cluster.num_segments == 0 {
            return Err(crate::Error::Config("cluster.num_segments must be positive".into()));
        }

        let mut seen = HashSet::new();
        for backup in &self.backups {
            if backup.site == self.node.site {
                return Err(crate::Error::Config(format!(
                    "backup site {} is the local site",
                    backup.site
                )));
            }
            if !seen.insert(backup.site.as_str()) {
                return Err(crate::Error::Config(format!(
                    "backup site {} is configured twice",
                    backup.site
                )));
            }
            if backup.chunk_size == 0 {
                return Err(crate::Error::Config(format!(
                    "backups.{}.chunk_size must be positive",
                    backup.site
                )));
            }
            if backup.timeout_ms == 0 {
                return Err(crate::Error::Config(format!(
                    "backups.{}.timeout_ms must be positive",
                    backup.site
                )));
            }
            if backup.is_sync() && backup.mode == XSiteStateTransferMode::Auto {
                return Err(crate::Error::Config(format!(
                    "backups.{}: automatic state transfer requires strategy = \"async\"",
                    backup.site
                )));
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Look up a backup by site name
    pub fn backup(&self, site: &str) -> Option<&BackupConfig> {
        self.backups.iter().find(|b| b.site == site)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get failure detection timeout as Duration
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.failure_timeout_ms)
    }
}
