//! Runtime configuration for kv-radix-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section falls back to its defaults, so a config file only needs the
//! fields it changes.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-radix-cache", about = "Prefix-indexed KV cache server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Cache shape and capacity.
    pub cache: CacheConfig,

    /// Backing object store.
    pub storage: StorageConfig,

    /// Eviction policy tuning.
    pub eviction: EvictionConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Cache layout and budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes of one layer's K and V tensors for a single token.
    pub tensor_nbytes: usize,

    /// Number of layers per slot.
    pub layer: usize,

    /// Slots per block (1..=64).
    pub block_size: usize,

    /// Token budget: the cache holds at most `ceil(cache_capacity / block_size)` blocks.
    pub cache_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // K and V, 8 KV heads * 128 head dim, FP16
            tensor_nbytes: 2 * 8 * 128 * 2,
            layer: 32,
            block_size: 16,
            cache_capacity: 16384,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Disk,
}

/// Object store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Root directory for the disk backend.
    pub path: PathBuf,

    /// Maximum bytes held by buffers and objects.
    pub capacity_bytes: usize,

    /// Apply zstd compression to sealed objects on disk.
    pub zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("/tmp/kv-radix-cache"),
            capacity_bytes: 8 * 1024 * 1024 * 1024, // 8 GB
            zstd_compression: true,
            zstd_level: 3,
        }
    }
}

/// Eviction policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Entries evicted per round when an update runs out of capacity.
    pub batch_size: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self { batch_size: 64 }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Size of one slot (a token's KV state across all layers) in bytes.
    pub fn slot_bytes(&self) -> usize {
        self.cache.tensor_nbytes * self.cache.layer
    }

    /// Maximum number of blocks the cache may hold.
    pub fn max_blocks(&self) -> usize {
        if self.cache.block_size == 0 {
            return 0;
        }
        self.cache.cache_capacity.div_ceil(self.cache.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.block_size, 16);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.eviction.batch_size, 64);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"cache": {"block_size": 4}, "storage": {"backend": "disk"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.cache.block_size, 4);
        assert_eq!(cfg.cache.layer, 32);
        assert_eq!(cfg.storage.backend, StorageBackend::Disk);
        assert_eq!(cfg.storage.zstd_level, 3);
        assert_eq!(cfg.server, ServerConfig::default());
    }

    #[test]
    fn test_max_blocks() {
        let mut cfg = Config::default();
        cfg.cache.cache_capacity = 17;
        cfg.cache.block_size = 4;
        assert_eq!(cfg.max_blocks(), 5);
        // K+V * 8 heads * 128 dims * fp16, 32 layers
        assert_eq!(cfg.slot_bytes(), 4096 * 32);
    }

    #[test]
    fn test_load_missing_file() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/kv-radix-cache.json")).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
