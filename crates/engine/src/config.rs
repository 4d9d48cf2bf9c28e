//! Configuration via `chainstore.toml`
//!
//! The file lives in the data directory. A commented default is written on
//! first use; command line flags override individual values.

use crate::fetch::{FetchOptions, PageOptions};
use crate::follower::FollowerOptions;
use crate::tail::TailOptions;
use alloy_primitives::Address;
use chainstore_core::error::{Error, Result};
use chainstore_storage::{
    KeyValueStorage, LogStoreOptions, LogStructuredStorage, RedbStorage, MemoryStorage,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "chainstore.toml";

/// Which [`KeyValueStorage`] holds the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Log-structured segment files under `<data>/store`
    Log,
    /// redb database at `<data>/store.redb`
    Redb,
    /// In-memory store; nothing survives the process
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "log" => Ok(BackendKind::Log),
            "redb" => Ok(BackendKind::Redb),
            "memory" => Ok(BackendKind::Memory),
            other => Err(Error::Config(format!(
                "Invalid backend '{}' in {}. Expected \"log\", \"redb\" or \"memory\".",
                other, CONFIG_FILE_NAME
            ))),
        }
    }
}

/// One deployed contract to index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexerConfig {
    /// Indexer name, also the log file name
    pub name: String,
    /// Contract address
    pub address: Address,
    /// Deployment block
    #[serde(default)]
    pub starting_block: u64,
}

/// Settings loaded from `chainstore.toml`.
///
/// # Example
///
/// ```toml
/// max_reorg_depth = 10
/// backend = "log"
/// rpc_url = "http://localhost:8545"
///
/// [[indexers]]
/// name = "token"
/// address = "0x0000000000000000000000000000000000000001"
/// starting_block = 100
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainstoreConfig {
    /// Blocks within this distance of the chain head may still be reorganized
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,
    /// Storage backend: `"log"`, `"redb"` or `"memory"`
    #[serde(default = "default_backend")]
    pub backend: String,
    /// JSON-RPC endpoint of the chain node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    /// Sleep between polls once at the chain tip, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive page halvings allowed for oversized log responses
    #[serde(default = "default_max_page_halvings")]
    pub max_page_halvings: u32,
    /// Blocks per log query before halving
    #[serde(default = "default_initial_page_size")]
    pub initial_page_size: u64,
    /// fsync the log-structured store on every batch
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
    /// Contracts to index
    #[serde(default)]
    pub indexers: Vec<IndexerConfig>,
}

fn default_max_reorg_depth() -> u64 {
    10
}

fn default_backend() -> String {
    "log".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_page_halvings() -> u32 {
    12
}

fn default_initial_page_size() -> u64 {
    2000
}

fn default_sync_writes() -> bool {
    true
}

impl Default for ChainstoreConfig {
    fn default() -> Self {
        Self {
            max_reorg_depth: default_max_reorg_depth(),
            backend: default_backend(),
            rpc_url: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_page_halvings: default_max_page_halvings(),
            initial_page_size: default_initial_page_size(),
            sync_writes: default_sync_writes(),
            indexers: Vec::new(),
        }
    }
}

impl ChainstoreConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# chainstore configuration
#
# Blocks within this distance of the chain head are kept in memory and may
# be replaced by a reorg. Deeper blocks are flushed to the store.
max_reorg_depth = 10

# Storage backend: "log" (default), "redb" or "memory"
#   "log"    = log-structured segment files under <data>/store
#   "redb"   = embedded transactional database at <data>/store.redb
#   "memory" = nothing is persisted
backend = "log"

# fsync the log-structured store after every batch
sync_writes = true

# JSON-RPC endpoint of the chain node
# rpc_url = "http://localhost:8545"

# Tail polling interval once caught up, in milliseconds
poll_interval_ms = 1000

# Log queries start at this many blocks per request and are halved when the
# node rejects a response as too large, at most max_page_halvings times in a row.
initial_page_size = 2000
max_page_halvings = 12

# Contracts to index.
# [[indexers]]
# name = "token"
# address = "0x0000000000000000000000000000000000000000"
# starting_block = 0
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, does not parse
    /// or names an unknown backend.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ChainstoreConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.backend_kind()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Parsed `backend`.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        self.backend.parse()
    }

    /// Follower settings.
    pub fn follower_options(&self) -> FollowerOptions {
        FollowerOptions {
            max_reorg_depth: self.max_reorg_depth,
            finalization_enabled: true,
        }
    }

    /// Fetch settings.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            max_reorg_depth: self.max_reorg_depth,
            page: PageOptions {
                initial_page_size: self.initial_page_size,
                max_page_halvings: self.max_page_halvings,
            },
        }
    }

    /// Tail settings.
    pub fn tail_options(&self, max_iterations: Option<u64>) -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_iterations,
        }
    }

    /// Open the configured backend under `data_dir`.
    pub fn open_storage(&self, data_dir: &Path) -> Result<Arc<dyn KeyValueStorage>> {
        let kind = self.backend_kind()?;
        info!(target: "chainstore::storage", backend = ?kind, dir = %data_dir.display(), "Opening storage");
        let storage: Arc<dyn KeyValueStorage> = match kind {
            BackendKind::Log => Arc::new(LogStructuredStorage::open(
                data_dir.join("store"),
                LogStoreOptions {
                    sync_writes: self.sync_writes,
                },
            )?),
            BackendKind::Redb => {
                std::fs::create_dir_all(data_dir)?;
                Arc::new(RedbStorage::open(data_dir.join("store.redb"))?)
            }
            BackendKind::Memory => Arc::new(MemoryStorage::new()),
        };
        Ok(storage)
    }
}
