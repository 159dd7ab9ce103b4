//! Persisted store configuration (`config.toml`).

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Current on-disk configuration format.
pub const CONFIG_VERSION: u32 = 1;

/// Default keep-last-N retention window.
pub const DEFAULT_KEEP_LAST: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub version: u32,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Number of most recent generations GC always keeps.
    pub keep_last: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Deletion worker threads; 0 means one per available CPU.
    pub delete_workers: usize,
    /// Attempts per trash entry before it is deferred to the next run.
    pub delete_retries: u32,
    /// Base delay of the doubling retry backoff.
    pub retry_backoff_ms: u64,
    /// Temporary files older than this are considered abandoned.
    pub tmp_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            algorithm: Algorithm::Blake3,
            retention: RetentionConfig::default(),
            gc: GcConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_last: DEFAULT_KEEP_LAST,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            delete_workers: 0,
            delete_retries: 3,
            retry_backoff_ms: 25,
            tmp_grace_secs: 3600,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 10_000,
        }
    }
}

impl GcConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn tmp_grace(&self) -> Duration {
        Duration::from_secs(self.tmp_grace_secs)
    }
}

impl LedgerConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl StoreConfig {
    /// Parse and validate a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(Error::invalid_config(format!(
                "Unsupported config version: {} (expected {})",
                self.version, CONFIG_VERSION
            )));
        }
        if self.retention.keep_last == 0 {
            return Err(Error::invalid_config("retention.keep_last must be at least 1"));
        }
        if self.gc.delete_retries == 0 {
            return Err(Error::invalid_config("gc.delete_retries must be at least 1"));
        }
        Ok(())
    }
}
