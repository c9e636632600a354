//! Configuration for the acquisition engine.
//!
//! Loaded once at startup and immutable afterwards. Unknown sources and
//! channels fall back to defaults, so a config file only needs entries for
//! the services that actually require tuning.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rate_limit::RateLimitConfig;
use crate::work_queue::DeliveryMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level engine configuration.
///
/// ```toml
/// [sources.mangadex]
/// requests = [2, 5]
/// pause = [10, 30]
///
/// [sources.anilist]
/// max_retries = 5
///
/// [channels."chapter-index"]
/// mode = "pooled"
/// workers = 2
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquireConfig {
    /// Per-source pacing and retry settings.
    pub sources: HashMap<String, RateLimitConfig>,
    /// Per-channel delivery settings.
    pub channels: HashMap<String, DeliveryMode>,
}

impl AcquireConfig {
    /// Load configuration from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Pacing for a source; defaults (retry only, no pacing) when unlisted.
    pub fn source_limits(&self, source: &str) -> RateLimitConfig {
        self.sources.get(source).copied().unwrap_or_default()
    }

    /// Delivery mode for a channel; inline when unlisted.
    pub fn channel_delivery(&self, channel: &str) -> DeliveryMode {
        self.channels.get(channel).copied().unwrap_or_default()
    }
}
