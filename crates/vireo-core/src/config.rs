//! Engine configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-player configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Upper bound on source resolution (ms); exceeding it fails the open
    pub resolve_timeout_ms: u64,
    /// Timeout for a single network request (ms)
    pub request_timeout_ms: u64,
    /// Bytes requested per network read
    pub chunk_size: usize,
    /// Bytes read ahead when a source is preloaded
    pub preload_bytes: usize,
    /// Duration of each delivered audio frame (ms)
    pub audio_frame_ms: u32,
    /// Interval between position events while playing (ms, 0 = off)
    pub position_report_interval_ms: u64,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Arm CDN failover when a player is created
    pub auto_switch_cdn: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            chunk_size: 64 * 1024,
            preload_bytes: 256 * 1024,
            audio_frame_ms: 20,
            position_report_interval_ms: 1_000,
            event_capacity: 256,
            auto_switch_cdn: false,
        }
    }
}

impl PlayerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resolve_timeout_ms == 0 {
            return Err(Error::InvalidConfig("resolve_timeout_ms must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if !(1..=1000).contains(&self.audio_frame_ms) {
            return Err(Error::InvalidConfig(
                "audio_frame_ms must be within 1..=1000".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Disk cache limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached files
    pub max_file_count: usize,
    /// Maximum total size of cached files (bytes)
    pub max_total_size: u64,
    /// Evict least-recently-used entries instead of refusing writes
    pub auto_remove: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_file_count: 1000,
            max_total_size: 1024 * 1024 * 1024, // 1 GB
            auto_remove: true,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_file_count == 0 {
            return Err(Error::InvalidConfig("max_file_count must be > 0".into()));
        }
        if self.max_total_size == 0 {
            return Err(Error::InvalidConfig("max_total_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub player: PlayerConfig,
    pub cache: CacheConfig,
}

impl EngineConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.player.validate()?;
        config.cache.validate()?;
        Ok(config)
    }
}
