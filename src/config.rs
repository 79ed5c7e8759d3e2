//! Tracker configuration
//!
//! A single [`TrackerConfig`] value is built once (defaults, optional JSON
//! file, CLI overrides) and passed to every component constructor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default number of headers per bulk archive file
pub const DEFAULT_HEADERS_PER_FILE: u32 = 100_000;

/// Default bound on the reorg ancestor walk
pub const DEFAULT_MAX_REORG_DEPTH: usize = 400;

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Headers closer than this to the tip stay in the live zone
pub const DEFAULT_LIVE_HEIGHT_THRESHOLD: u32 = 2_000;

/// Minimum number of eligible headers before compaction writes a bulk row
pub const DEFAULT_BULK_MIGRATION_CHUNK: u32 = 500;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which chain an instance tracks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Other(String),
}

impl Network {
    /// Name used in archive manifests (`main`, `test`, ...)
    pub fn archive_name(&self) -> &str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Other(name) => name,
        }
    }

    /// Manifest file published by the bulk archive for this chain
    pub fn default_manifest_file(&self) -> String {
        format!("{}NetBlockHeaders.json", self.archive_name())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.archive_name())
    }
}

impl std::str::FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" => Err(ConfigError::Invalid("empty network name".to_string())),
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            other => Ok(Network::Other(other.to_string())),
        }
    }
}

/// Fork choice on equal cumulative work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the branch seen first
    #[default]
    FirstSeen,
    /// Switch to the newly observed branch
    PreferNew,
}

/// Configuration threaded through the tracker, bootstrapper and stores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub network: Network,
    /// Base URL of the bulk header archive
    pub cdn_url: Option<String>,
    /// Manifest file name; derived from the network when unset
    pub manifest_file: Option<String>,
    pub headers_per_file: u32,
    pub max_reorg_depth: usize,
    pub tie_break: TieBreak,
    pub subscriber_capacity: usize,
    pub live_height_threshold: u32,
    pub bulk_migration_chunk: u32,
    /// Data directory for header storage
    pub data_dir: PathBuf,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            network: Network::Main,
            cdn_url: None,
            manifest_file: None,
            headers_per_file: DEFAULT_HEADERS_PER_FILE,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            tie_break: TieBreak::FirstSeen,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            live_height_threshold: DEFAULT_LIVE_HEIGHT_THRESHOLD,
            bulk_migration_chunk: DEFAULT_BULK_MIGRATION_CHUNK,
            data_dir: PathBuf::from(".chaintracks_data"),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

impl TrackerConfig {
    /// Defaults for `network`
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.headers_per_file == 0 {
            return Err(ConfigError::Invalid("headers_per_file must be > 0".to_string()));
        }
        if self.max_reorg_depth == 0 {
            return Err(ConfigError::Invalid("max_reorg_depth must be > 0".to_string()));
        }
        if self.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid(
                "subscriber_capacity must be > 0".to_string(),
            ));
        }
        if self.backup_enabled && self.max_backups == 0 {
            return Err(ConfigError::Invalid(
                "max_backups must be > 0 when backups are enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn manifest_file(&self) -> String {
        self.manifest_file
            .clone()
            .unwrap_or_else(|| self.network.default_manifest_file())
    }
}
