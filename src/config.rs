// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Library configuration.
//!
//! Stored as JSON. Every field has a default so a missing or partial file
//! still yields a usable configuration.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default sharegroup name for asset downloads.
pub const DEFAULT_SHAREGROUP: &str = "default";

/// Credentials used to sign outgoing requests.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct SigningConfig {
    pub app_name: String,
    pub app_version: String,
    /// HMAC secret. Never logged.
    pub secret: String,
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("app_name", &self.app_name)
            .field("app_version", &self.app_version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Root of the on-disk cache; assets live under `<cache_root>/assets`.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    /// Metadata store path. Defaults to `<cache_root>/assets.db`.
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// HTTP sharegroup used for asset downloads
    #[serde(default = "default_sharegroup")]
    pub sharegroup: String,
    #[serde(default)]
    pub signing: Option<SigningConfig>,
    /// Maximum number of transfers running at once
    #[serde(default = "default_max_active_requests")]
    pub max_active_requests: usize,
    /// Minimum gap between two progress events of one request
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Start in offline mode (TTL cleanup is skipped while offline)
    #[serde(default)]
    pub offline: bool,
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|c| c.join("assetlib"))
        .unwrap_or_else(|| PathBuf::from(".assetlib"))
}

fn default_sharegroup() -> String {
    DEFAULT_SHAREGROUP.to_string()
}

fn default_max_active_requests() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    100
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            database: None,
            sharegroup: default_sharegroup(),
            signing: None,
            max_active_requests: default_max_active_requests(),
            progress_interval_ms: default_progress_interval_ms(),
            request_timeout_secs: None,
            offline: false,
        }
    }
}

impl LibraryConfig {
    /// Configuration rooted at `cache_root` with every other field defaulted.
    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    /// Path of the metadata store.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.cache_root.join("assets.db"))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Default config file location (`<config dir>/assetlib/config.json`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|c| c.join("assetlib").join("config.json"))
            .unwrap_or_else(|| PathBuf::from(".assetlib/config.json"))
    }

    /// Load configuration, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Save configuration with a temp file + atomic rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config to JSON")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .context("Failed to write to temp file")?;
            temp_file
                .sync_all()
                .context("Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} -> {:?}", temp_path, path))?;
        Ok(())
    }
}
