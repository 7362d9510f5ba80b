//! Cache configuration via `geocache.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working cache. To change settings, edit the file and reopen the cache.

use geocache_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name conventionally placed next to the cache root.
pub const CONFIG_FILE_NAME: &str = "geocache.toml";

/// Secondary store used to spill payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Append-only partitioned block files
    #[default]
    Disk,
    /// External keyed object registry
    Registry,
}

/// Cache configuration loaded from `geocache.toml`.
///
/// # Example
///
/// ```toml
/// max_entries = 2000000
/// resident_pool_size = 50000
/// backend = "disk"
/// disk_root = "/var/tmp/geocache"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries (ignored when `unlimited`).
    pub max_entries: usize,
    /// Disable the entry-count bound.
    pub unlimited: bool,
    /// Target number of entries whose payload stays in memory.
    pub resident_pool_size: usize,
    /// Resident floor under critical memory pressure.
    pub min_resident: usize,
    /// Records per disk block file; also the disk spill batch size.
    pub max_records_per_file: usize,
    /// Objects per registry insert batch.
    pub registry_block_size: usize,
    /// Delete backend data when records are removed.
    pub remove_from_store_on_remove: bool,
    /// Spill workers per available core.
    pub spill_threads_per_core: usize,
    /// Fetch workers per available core.
    pub fetch_threads_per_core: usize,
    /// Queued tasks per pool before submissions are refused.
    pub max_queue_depth: usize,
    /// Idle time after which a pool worker exits.
    pub idle_timeout_ms: u64,
    /// Delay that coalesces repeated eviction requests into one pass.
    pub eviction_debounce_ms: u64,
    /// Retrieval groups dispatched per wave; `is_complete` is checked between waves.
    pub retrieve_wave_groups: usize,
    /// Secondary store.
    pub backend: BackendKind,
    /// Root directory of the disk store (defaults to the system temp dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_root: Option<PathBuf>,
    /// Encrypt metadata and geometry when a cipher factory is supplied.
    pub encryption: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000_000,
            unlimited: false,
            resident_pool_size: 50_000,
            min_resident: 1_000,
            max_records_per_file: 10_000,
            registry_block_size: 1_000,
            remove_from_store_on_remove: true,
            spill_threads_per_core: 1,
            fetch_threads_per_core: 2,
            max_queue_depth: 65_536,
            idle_timeout_ms: 30_000,
            eviction_debounce_ms: 250,
            retrieve_wave_groups: 8,
            backend: BackendKind::Disk,
            disk_root: None,
            encryption: false,
        }
    }
}

impl CacheConfig {
    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("resident_pool_size", self.resident_pool_size),
            ("max_records_per_file", self.max_records_per_file),
            ("registry_block_size", self.registry_block_size),
            ("spill_threads_per_core", self.spill_threads_per_core),
            ("fetch_threads_per_core", self.fetch_threads_per_core),
            ("max_queue_depth", self.max_queue_depth),
            ("retrieve_wave_groups", self.retrieve_wave_groups),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::ConfigError(format!("{} must be greater than zero", name)));
            }
        }
        if !self.unlimited && self.max_entries == 0 {
            return Err(Error::ConfigError(
                "max_entries must be greater than zero unless unlimited = true".to_string(),
            ));
        }
        if self.min_resident > self.resident_pool_size {
            return Err(Error::ConfigError(format!(
                "min_resident ({}) exceeds resident_pool_size ({})",
                self.min_resident, self.resident_pool_size
            )));
        }
        Ok(())
    }

    /// Root directory of the disk store.
    pub fn disk_root(&self) -> PathBuf {
        self.disk_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("geocache"))
    }

    /// Number of spill workers.
    pub fn spill_threads(&self) -> usize {
        self.spill_threads_per_core.max(1) * available_cores()
    }

    /// Number of fetch workers.
    pub fn fetch_threads(&self) -> usize {
        self.fetch_threads_per_core.max(1) * available_cores()
    }

    /// Pool worker idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Eviction debounce delay.
    pub fn eviction_debounce(&self) -> Duration {
        Duration::from_millis(self.eviction_debounce_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# geocache configuration

# Entry-count bound; inserts that would exceed it fail atomically.
max_entries = 10000000
unlimited = false

# Payloads kept in memory. Under WARNING pressure the target halves
# (never below min_resident); under CRITICAL it drops to min_resident.
resident_pool_size = 50000
min_resident = 1000

# Secondary store: "disk" or "registry"
backend = "disk"
# disk_root = "/var/tmp/geocache"
max_records_per_file = 10000
registry_block_size = 1000
remove_from_store_on_remove = true

# Encrypt metadata and geometry (origin ids are always stored in clear).
encryption = false

# I/O pools
spill_threads_per_core = 1
fetch_threads_per_core = 2
max_queue_depth = 65536
idle_timeout_ms = 30000

# Query retrieval and eviction pacing
retrieve_wave_groups = 8
eviction_debounce_ms = 250
"#
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml(&content).map_err(|e| {
            Error::ConfigError(format!("Invalid config file '{}': {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Parse and validate config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CacheConfig =
            toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
