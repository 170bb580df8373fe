//! Runtime configuration.
//!
//! | Variable                      | Default                  |
//! |-------------------------------|--------------------------|
//! | `POS_DATA_DIR`                | platform app-data dir    |
//! | `POS_API_URL`                 | (none)                   |
//! | `POS_API_KEY`                 | (none)                   |
//! | `POS_TENANT_ID`               | (none)                   |
//! | `POS_CONNECTION_STRING`       | fills url/key/tenant     |
//! | `POS_MAX_RETRIES`             | 5                        |
//! | `POS_RETRY_DELAY_MS`          | 5000                     |
//! | `POS_MAX_RETRY_DELAY_MS`      | 300000                   |
//! | `POS_BATCH_SIZE`              | 10                       |
//! | `POS_AUTO_SYNC_INTERVAL_SECS` | 15                       |
//! | `POS_PROBE_INTERVAL_SECS`     | 15                       |
//! | `POS_CLEANUP_AFTER_DAYS`      | 7                        |
//! | `POS_CONFLICT_STRATEGY`       | server-wins              |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::api::{decode_connection_string, normalize_base_url};
use crate::conflict::ConflictStrategy;
use crate::error::{PosError, Result};

const APP_DIR_NAME: &str = "the-small-pos";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub batch_size: usize,
    pub auto_sync_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub cleanup_after_days: i64,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 300_000,
            batch_size: 10,
            auto_sync_interval_secs: 15,
            probe_interval_secs: 15,
            cleanup_after_days: 7,
            conflict_strategy: ConflictStrategy::ServerWins,
        }
    }
}

impl SyncConfig {
    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PosConfig {
    pub data_dir: PathBuf,
    pub api_base_url: String,
    pub api_key: String,
    pub tenant_id: String,
    pub sync: SyncConfig,
}

impl Default for PosConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_base_url: String::new(),
            api_key: String::new(),
            tenant_id: String::new(),
            sync: SyncConfig::default(),
        }
    }
}

impl PosConfig {
    /// Build from `POS_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = env_var("POS_CONNECTION_STRING") {
            config.apply_connection_string(&raw)?;
        }
        if let Some(dir) = env_var("POS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_var("POS_API_URL") {
            config.api_base_url = url;
        }
        if let Some(key) = env_var("POS_API_KEY") {
            config.api_key = key;
        }
        if let Some(tenant) = env_var("POS_TENANT_ID") {
            config.tenant_id = tenant;
        }

        let sync = &mut config.sync;
        parse_env("POS_MAX_RETRIES", &mut sync.max_retries)?;
        parse_env("POS_RETRY_DELAY_MS", &mut sync.retry_delay_ms)?;
        parse_env("POS_MAX_RETRY_DELAY_MS", &mut sync.max_retry_delay_ms)?;
        parse_env("POS_BATCH_SIZE", &mut sync.batch_size)?;
        parse_env("POS_AUTO_SYNC_INTERVAL_SECS", &mut sync.auto_sync_interval_secs)?;
        parse_env("POS_PROBE_INTERVAL_SECS", &mut sync.probe_interval_secs)?;
        parse_env("POS_CLEANUP_AFTER_DAYS", &mut sync.cleanup_after_days)?;
        if let Some(raw) = env_var("POS_CONFLICT_STRATEGY") {
            sync.conflict_strategy = ConflictStrategy::parse(&raw)?;
        }

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load a camelCase JSON config file; absent fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| PosError::config(format!("{}: {e}", path.display())))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill url, key and tenant from an onboarding connection string.
    pub fn apply_connection_string(&mut self, raw: &str) -> Result<()> {
        let decoded = decode_connection_string(raw)
            .ok_or_else(|| PosError::config("connection string could not be decoded"))?;
        if let Some(url) = decoded.url {
            self.api_base_url = url;
        }
        if let Some(key) = decoded.api_key {
            self.api_key = key;
        }
        if let Some(tenant) = decoded.tenant_id {
            self.tenant_id = tenant;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(PosError::config("tenant id is required"));
        }
        if self.sync.max_retries == 0 {
            return Err(PosError::config("max retries must be at least 1"));
        }
        if self.sync.batch_size == 0 {
            return Err(PosError::config("batch size must be at least 1"));
        }
        if self.sync.auto_sync_interval_secs == 0 || self.sync.probe_interval_secs == 0 {
            return Err(PosError::config("sync and probe intervals must be at least 1s"));
        }
        if self.sync.retry_delay_ms > self.sync.max_retry_delay_ms {
            return Err(PosError::config(
                "retry delay must not exceed max retry delay",
            ));
        }
        if self.sync.cleanup_after_days < 0 {
            return Err(PosError::config("cleanup days must not be negative"));
        }
        Ok(())
    }

    pub fn has_remote(&self) -> bool {
        !self.api_base_url.is_empty()
    }

    fn normalize(&mut self) {
        self.api_base_url = normalize_base_url(&self.api_base_url);
        self.api_key = self.api_key.trim().to_string();
        self.tenant_id = self.tenant_id.trim().to_string();
    }
}

/// Per-user app data directory, mirroring where the desktop app keeps its
/// database and logs.
pub fn default_data_dir() -> PathBuf {
    let base = if cfg!(target_os = "windows") {
        std::env::var("LOCALAPPDATA").map(PathBuf::from).ok()
    } else {
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".local").join("share"))
                    .ok()
            })
    };
    base.unwrap_or_else(std::env::temp_dir).join(APP_DIR_NAME)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(name: &str, slot: &mut T) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *slot = raw
            .parse()
            .map_err(|_| PosError::config(format!("{name} has invalid value '{raw}'")))?;
    }
    Ok(())
}
