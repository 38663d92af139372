//! Typed settings for sync, watch, encryption and remote transports.
//!
//! Loaded from TOML. The core components never read files themselves; they
//! receive values derived from a validated [`Config`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, SyncError, SyncResult};
use crate::sync::checksum::HashType;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const APP_DIR: &str = "mirrorsync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub ignore_patterns: Vec<String>,
    /// Block size in bytes for block-level change detection.
    pub block_size: u64,
    /// Files at or above this size are patched block by block.
    pub delta_threshold: u64,
    pub hash: HashType,
    /// Concurrent file transfers; 1 keeps the apply pass strictly sequential.
    pub workers: usize,
    /// Bytes per second, 0 for unlimited.
    pub bandwidth_limit: u64,
    /// Per-operation timeout for remote transport calls.
    pub op_timeout_ms: Option<u64>,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            ignore_patterns: vec![".git/".into(), "*.tmp".into(), "*.swp".into()],
            block_size: 4096,
            delta_threshold: 1024 * 1024,
            hash: HashType::Blake3,
            workers: 1,
            bandwidth_limit: 0,
            op_timeout_ms: None,
        }
    }
}

impl SyncSection {
    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSection {
    pub enabled: bool,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub debounce_ms: u64,
    pub recursive: bool,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            recursive: true,
        }
    }
}

impl WatchSection {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Where remote destinations live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    Sftp {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        username: String,
        #[serde(default)]
        key_file: Option<PathBuf>,
    },
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
    Gcs {
        bucket: String,
        #[serde(default)]
        credential_path: Option<PathBuf>,
    },
    Fs {
        root: PathBuf,
    },
}

impl RemoteConfig {
    fn validate(&self) -> SyncResult<()> {
        let missing = |field: &str| SyncError::Config(format!("remote.{field} must not be empty"));
        match self {
            RemoteConfig::Sftp { host, username, .. } => {
                if host.trim().is_empty() {
                    return Err(missing("host"));
                }
                if username.trim().is_empty() {
                    return Err(missing("username"));
                }
            }
            RemoteConfig::S3 { bucket, region, .. } => {
                if bucket.trim().is_empty() {
                    return Err(missing("bucket"));
                }
                if region.trim().is_empty() {
                    return Err(missing("region"));
                }
            }
            RemoteConfig::Gcs { bucket, .. } => {
                if bucket.trim().is_empty() {
                    return Err(missing("bucket"));
                }
            }
            RemoteConfig::Fs { root } => {
                if root.as_os_str().is_empty() {
                    return Err(missing("root"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncSection,
    pub encryption: EncryptionSection,
    pub watch: WatchSection,
    pub remote: Option<RemoteConfig>,
}

impl Config {
    /// Platform default: `<config dir>/mirrorsync/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = fs::read_to_string(path).with_path("reading config", path)?;
        toml::from_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e.message())))
    }

    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("serializing config: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_path("creating config directory", parent)?;
        }
        fs::write(path, text).with_path("writing config", path)
    }

    /// Load `path` if it exists; otherwise return defaults, writing them back
    /// to `path` when possible.
    pub fn load_or_default(path: &Path) -> SyncResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        if let Err(e) = config.save(path) {
            tracing::debug!(error = %e, "could not persist default config");
        }
        Ok(config)
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync.block_size == 0 {
            return Err(SyncError::Config("sync.block_size must be greater than zero".into()));
        }
        if self.sync.workers == 0 {
            return Err(SyncError::Config("sync.workers must be at least 1".into()));
        }
        if let Some(empty) = self.sync.ignore_patterns.iter().position(|p| p.trim().is_empty()) {
            return Err(SyncError::Config(format!(
                "sync.ignore_patterns[{empty}] is empty"
            )));
        }
        if self.encryption.enabled && self.encryption.key_file.is_none() {
            return Err(SyncError::Config(
                "encryption.enabled requires encryption.key_file".into(),
            ));
        }
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        Ok(())
    }
}
