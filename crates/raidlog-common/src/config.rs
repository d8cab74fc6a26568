//! Configuration types for raidlog
//!
//! This module defines the tunables of the journal engine and the backing
//! device it writes to.

use crate::error::{Error, Result};
use crate::types::{CacheMode, Sector};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Journal engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Write-through or write-back caching
    pub cache_mode: CacheMode,
    /// Periodic wake-up of the reclaim thread (milliseconds)
    pub reclaim_interval_ms: u64,
    /// Capacity of the I/O unit arena and the metadata page pool.
    /// Two units are enough to make progress.
    pub pool_size: usize,
    /// Threads executing journal writes and flushes
    pub io_workers: usize,
    /// Reclaim runs once this much space is reclaimable (sectors)
    pub max_free_space: Sector,
    /// Reclaim also runs once 1/2^shift of the device is reclaimable
    pub max_free_space_shift: u32,
    /// Sequence gap between the last replayed block and the sentinel block
    /// written after recovery
    pub sentinel_seq_margin: u64,
    /// Force the flush-before-durable step on or off instead of asking the
    /// device
    pub need_cache_flush: Option<bool>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::WriteBack,
            reclaim_interval_ms: 5_000,
            pool_size: 4,
            io_workers: 2,
            max_free_space: 10 * 1024 * 1024 * 2, // 10 GiB
            max_free_space_shift: 2,
            sentinel_seq_margin: 10,
            need_cache_flush: None,
        }
    }
}

impl JournalConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool_size < 2 {
            return Err(Error::Configuration(format!(
                "pool_size must be at least 2, got {}",
                self.pool_size
            )));
        }
        if self.io_workers == 0 {
            return Err(Error::Configuration("io_workers must be non-zero".into()));
        }
        if self.reclaim_interval_ms == 0 {
            return Err(Error::Configuration(
                "reclaim_interval_ms must be non-zero".into(),
            ));
        }
        if self.max_free_space_shift >= 64 {
            return Err(Error::Configuration(format!(
                "max_free_space_shift out of range: {}",
                self.max_free_space_shift
            )));
        }
        if self.sentinel_seq_margin == 0 {
            return Err(Error::Configuration(
                "sentinel_seq_margin must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Periodic reclaim interval
    #[must_use]
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

/// Backing device configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path to the journal device or file
    pub path: PathBuf,
    /// Use direct I/O (O_DIRECT on Linux)
    pub direct_io: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/raidlog/journal"),
            direct_io: true,
        }
    }
}
