use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::utils::paths::{resolve_base_dir, PORTABLE_MARKER};

pub const DEFAULT_CATALOGUE_URL: &str =
    "https://myrient.erista.me/files/Redump/Microsoft%20-%20Xbox%20360/";
/// Largest expected source image (dual-layer DVD plus conversion overhead).
pub const DEFAULT_FALLBACK_SIZE_ESTIMATE: u64 = 9 * 1024 * 1024 * 1024;
pub const DEFAULT_SAFETY_BUFFER: u64 = 512 * 1024 * 1024;
pub const DEFAULT_DOWNLOAD_ATTEMPTS: usize = 3;
pub const DEFAULT_CONVERT_TIMEOUT_SECS: u64 = 60 * 60;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct RomToolConfig {
    /// Directory containing `bin/exiso` and `bin/iso2god`.
    pub base_dir: PathBuf,
    pub catalogue_url: String,
    /// Parent of the per-run `romtool_<id>` working directories.
    pub temp_root: PathBuf,
    pub fallback_size_estimate: u64,
    pub safety_buffer: u64,
    pub download_max_attempts: usize,
    pub download_retry_wait_ms: u64,
    pub connect_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub convert_timeout_secs: u64,
}

impl Default for RomToolConfig {
    fn default() -> Self {
        Self {
            base_dir: resolve_base_dir(),
            catalogue_url: DEFAULT_CATALOGUE_URL.to_string(),
            temp_root: std::env::temp_dir(),
            fallback_size_estimate: DEFAULT_FALLBACK_SIZE_ESTIMATE,
            safety_buffer: DEFAULT_SAFETY_BUFFER,
            download_max_attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            download_retry_wait_ms: 500,
            connect_timeout_secs: 30,
            http_timeout_secs: 30,
            convert_timeout_secs: DEFAULT_CONVERT_TIMEOUT_SECS,
        }
    }
}

impl RomToolConfig {
    /// Reads `path` when it exists, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<RomToolConfig>(&data)?
        } else {
            RomToolConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from_root(root: &Path) -> Result<Self> {
        Self::load(&root.join(PORTABLE_MARKER))
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_string("ROMTOOL_BASE") {
            self.base_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("ROMTOOL_CATALOGUE_URL") {
            self.catalogue_url = value;
        }
        if let Some(value) = env_string("ROMTOOL_TEMP_DIR") {
            self.temp_root = PathBuf::from(value);
        }
        if let Some(value) = env_usize("ROMTOOL_DOWNLOAD_MAX_ATTEMPTS") {
            self.download_max_attempts = value.clamp(1, 10);
        }
        if let Some(value) = env_usize("ROMTOOL_DOWNLOAD_RETRY_WAIT_MS") {
            self.download_retry_wait_ms = value.min(60_000) as u64;
        }
        if let Some(value) = env_usize("ROMTOOL_CONVERT_TIMEOUT_SECS") {
            self.convert_timeout_secs = (value as u64).max(1);
        }
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse::<usize>().ok()
}
