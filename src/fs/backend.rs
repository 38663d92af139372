use async_trait::async_trait;

use crate::error::SyncResult;
use crate::sync::checksum::{FileChecksum, HashType};

/// Backend type information for display and identification
#[derive(Debug, Clone, PartialEq)]
pub enum BackendType {
    Local,
    Sftp { host: String },
    S3 { bucket: String, region: String },
    Gcs { bucket: String },
}

impl BackendType {
    /// Get a short display name for the backend
    pub fn short_name(&self) -> &'static str {
        match self {
            BackendType::Local => "Local",
            BackendType::Sftp { .. } => "SFTP",
            BackendType::S3 { .. } => "S3",
            BackendType::Gcs { .. } => "GCS",
        }
    }
}

/// Backend capability flags
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportCapabilities {
    /// Supports symbolic links
    pub symlinks: bool,
    /// Honours Unix permission bits on written files
    pub permissions: bool,
    /// Can report content checksums, enabling skip-if-unchanged
    pub checksums: bool,
}

impl TransportCapabilities {
    /// Local filesystem capabilities
    pub fn local() -> Self {
        Self {
            symlinks: true,
            permissions: true,
            checksums: true,
        }
    }

    /// Object stores and file-transfer protocols without link support
    pub fn object_store() -> Self {
        Self::default()
    }
}

/// Remote side of a sync. Paths are `/`-separated and relative to the
/// transport's own root.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Create a directory and any missing parents. Must succeed if it already exists.
    async fn create_directory(&self, path: &str) -> SyncResult<()>;

    /// Persist `data` at `path`, replacing any existing file.
    async fn write_file(&self, path: &str, data: Vec<u8>, mode: u32) -> SyncResult<()>;

    /// Create a symlink at `path` pointing at `target`, replacing any existing entry.
    async fn create_symlink(&self, target: &str, path: &str) -> SyncResult<()>;

    /// Checksum of an existing file, or `None` if absent or unsupported.
    async fn file_checksum(
        &self,
        _path: &str,
        _algorithm: HashType,
    ) -> SyncResult<Option<FileChecksum>> {
        Ok(None)
    }

    /// Get the backend type
    fn backend_type(&self) -> BackendType;

    /// Get backend capabilities
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::default()
    }

    /// Get display path for a location on this transport
    fn display_path(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Join a `/`-separated remote root and a relative path.
pub fn join_remote(root: &str, relative: &str) -> String {
    let root = root.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    match (root.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => root.to_string(),
        (false, false) => format!("{root}/{relative}"),
    }
}
