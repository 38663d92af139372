use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::fs::backend::{BackendType, RemoteTransport, TransportCapabilities};
use crate::sync::checksum::{ChecksumCalculator, FileChecksum, HashType};
use crate::sync::entry::{apply_mode, make_symlink, remove_existing};

/// Transport rooted at a local directory, e.g. a mounted share.
pub struct LocalTransport {
    pub root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn map_err(path: &str) -> impl FnOnce(io::Error) -> SyncError + '_ {
        move |e| SyncError::transport(path, e)
    }
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    async fn create_directory(&self, path: &str) -> SyncResult<()> {
        tokio::fs::create_dir_all(self.full_path(path))
            .await
            .map_err(Self::map_err(path))
    }

    async fn write_file(&self, path: &str, data: Vec<u8>, mode: u32) -> SyncResult<()> {
        let dest = self.full_path(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Self::map_err(path))?;
        }
        tokio::fs::write(&dest, data)
            .await
            .map_err(Self::map_err(path))?;
        apply_mode(&dest, mode).await.map_err(Self::map_err(path))
    }

    async fn create_symlink(&self, target: &str, path: &str) -> SyncResult<()> {
        let link = self.full_path(path);
        remove_existing(&link).await.map_err(Self::map_err(path))?;
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Self::map_err(path))?;
        }
        make_symlink(Path::new(target), &link)
            .await
            .map_err(Self::map_err(path))
    }

    async fn file_checksum(
        &self,
        path: &str,
        algorithm: HashType,
    ) -> SyncResult<Option<FileChecksum>> {
        let full = self.full_path(path);
        match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_file() => ChecksumCalculator::new(algorithm)
                .whole_file_checksum_async(&full)
                .await
                .map(Some),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::transport(path, e)),
        }
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::local()
    }

    fn display_path(&self, path: &str) -> String {
        self.full_path(path).to_string_lossy().to_string()
    }
}
