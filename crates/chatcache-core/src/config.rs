//! Configuration types and loading for chatcache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::error::Result;
use crate::retry::RetryPolicy;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the cache database.
    pub database: PathBuf,

    /// Reconciliation settings.
    pub sync: SyncConfig,

    /// Backoff for remote fetches inside backfill jobs.
    pub retry: RetryPolicy,

    /// Remote API settings.
    pub remote: RemoteConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::APP_NAME);

        Self {
            database: data_dir.join("cache.db"),
            sync: SyncConfig::default(),
            retry: RetryPolicy::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default config file.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::default_config_path())
    }

    /// Load configuration from a file, layered with `CHATCACHE__*` environment variables.
    ///
    /// A missing file yields the defaults plus any environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(&crate::env_prefix())
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.expand_paths();
        Ok(config)
    }

    /// Get the default config file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::APP_NAME)
            .join("config.toml")
    }

    /// Save configuration to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure config exists at the given path, creating defaults if missing.
    pub fn ensure_at(path: &Path) -> Result<Self> {
        if !path.exists() {
            Self::default().save_to_path(path)?;
        }
        Self::load_from_path(path)
    }

    /// Expand a path, replacing ~ with home directory.
    pub fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::full(path)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| path.to_string());
        PathBuf::from(expanded)
    }

    fn expand_paths(&mut self) {
        self.database = Self::expand_path(&self.database.to_string_lossy());
    }
}

/// How far delta reconciliation may advance a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaPolicy {
    /// Only through buffered ids that directly follow the watermark.
    #[default]
    Strict,
    /// Up to the highest buffered id, gaps included.
    Permissive,
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a cycle waits for a conversation listing before fetching one.
    pub listing_timeout_secs: u64,

    /// Delta reconciliation policy.
    pub delta_policy: DeltaPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listing_timeout_secs: 10,
            delta_policy: DeltaPolicy::Strict,
        }
    }
}

impl SyncConfig {
    pub fn listing_timeout(&self) -> Duration {
        Duration::from_secs(self.listing_timeout_secs)
    }
}

/// Remote API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the REST API.
    pub base_url: String,

    /// Access token; usually supplied via environment rather than the file.
    pub token: Option<String>,

    /// Messages (or listing entries) requested per page.
    pub page_size: u32,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groupme.com/v3".to_string(),
            token: None,
            page_size: 100,
            timeout_secs: 30,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
