use async_trait::async_trait;
use opendal::{
    services::{Fs, Gcs, Sftp, S3},
    Operator,
};

use crate::config::RemoteConfig;
use crate::error::{SyncError, SyncResult};
use crate::fs::backend::{BackendType, RemoteTransport, TransportCapabilities};

const DEFAULT_SSH_PORT: u16 = 22;

/// Remote transport over OpenDAL: SFTP, S3-compatible stores, GCS or a
/// plain directory. None of these expose symlinks or permission bits.
pub struct OpendalTransport {
    operator: Operator,
    backend: BackendType,
}

impl OpendalTransport {
    pub fn from_config(config: &RemoteConfig) -> SyncResult<Self> {
        let (operator, backend) = match config {
            RemoteConfig::Sftp {
                host,
                port,
                username,
                key_file,
            } => {
                let endpoint = format!("ssh://{}:{}", host, port.unwrap_or(DEFAULT_SSH_PORT));
                let mut builder = Sftp::default().endpoint(&endpoint).user(username);
                if let Some(key) = key_file {
                    builder = builder.key(&key.to_string_lossy());
                }
                (
                    Operator::new(builder).map_err(Self::build_err(host))?.finish(),
                    BackendType::Sftp { host: host.clone() },
                )
            }
            RemoteConfig::S3 {
                bucket,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            } => {
                let mut builder = S3::default().bucket(bucket).region(region);
                if let Some(endpoint) = endpoint {
                    builder = builder.endpoint(endpoint);
                }
                // Without explicit keys OpenDAL falls back to the AWS credential chain
                if let (Some(id), Some(secret)) = (access_key_id, secret_access_key) {
                    builder = builder.access_key_id(id).secret_access_key(secret);
                }
                (
                    Operator::new(builder).map_err(Self::build_err(bucket))?.finish(),
                    BackendType::S3 {
                        bucket: bucket.clone(),
                        region: region.clone(),
                    },
                )
            }
            RemoteConfig::Gcs {
                bucket,
                credential_path,
            } => {
                let mut builder = Gcs::default().bucket(bucket);
                if let Some(path) = credential_path {
                    builder = builder.credential_path(&path.to_string_lossy());
                }
                (
                    Operator::new(builder).map_err(Self::build_err(bucket))?.finish(),
                    BackendType::Gcs {
                        bucket: bucket.clone(),
                    },
                )
            }
            RemoteConfig::Fs { root } => {
                let root = root.to_string_lossy();
                let builder = Fs::default().root(&root);
                (
                    Operator::new(builder).map_err(Self::build_err(&root))?.finish(),
                    BackendType::Local,
                )
            }
        };

        Ok(Self { operator, backend })
    }

    fn build_err(label: &str) -> impl FnOnce(opendal::Error) -> SyncError + '_ {
        move |e| SyncError::transport(label, e)
    }

    fn object_path(path: &str) -> &str {
        path.trim_start_matches('/')
    }
}

#[async_trait]
impl RemoteTransport for OpendalTransport {
    async fn create_directory(&self, path: &str) -> SyncResult<()> {
        let path = Self::object_path(path);
        if path.is_empty() {
            return Ok(());
        }
        let dir = format!("{}/", path.trim_end_matches('/'));
        self.operator
            .create_dir(&dir)
            .await
            .map_err(|e| SyncError::transport(path, e))
    }

    async fn write_file(&self, path: &str, data: Vec<u8>, _mode: u32) -> SyncResult<()> {
        let path = Self::object_path(path);
        self.operator
            .write(path, data)
            .await
            .map_err(|e| SyncError::transport(path, e))?;
        Ok(())
    }

    async fn create_symlink(&self, _target: &str, path: &str) -> SyncResult<()> {
        Err(SyncError::transport(
            path,
            format!("{} transport does not support symlinks", self.backend.short_name()),
        ))
    }

    fn backend_type(&self) -> BackendType {
        self.backend.clone()
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::object_store()
    }

    fn display_path(&self, path: &str) -> String {
        match &self.backend {
            BackendType::Sftp { host } => format!("{host}:{path}"),
            BackendType::S3 { bucket, .. } => format!("s3://{bucket}/{}", Self::object_path(path)),
            BackendType::Gcs { bucket } => format!("gs://{bucket}/{}", Self::object_path(path)),
            BackendType::Local => path.to_string(),
        }
    }
}
