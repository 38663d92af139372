//! Error taxonomy for sync, watch and transport operations.
//!
//! Every failure that aborts a sync names the path it happened on, so the
//! caller can report exactly where a best-effort mirror stopped.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Open/read/write/permission failure on a local path.
    #[error("I/O error while {operation} {}: {source}", path.display())]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: io::Error,
    },

    /// Remote connectivity, auth or protocol failure. Never retried.
    #[error("transport error at {path}: {message}")]
    Transport { path: String, message: String },

    /// Bad key, truncated ciphertext or failed authentication.
    #[error("crypto error for {}: {reason}", path.display())]
    Crypto { path: PathBuf, reason: String },

    /// Invalid settings, surfaced before any traversal begins.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Raised by the OS notification layer; never terminates watching.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A remote operation exceeded the configured per-operation timeout.
    #[error("operation on {path} timed out after {after:?}")]
    Timeout { path: String, after: Duration },

    /// The run was cancelled before `path` was processed.
    #[error("sync cancelled before {}", path.display())]
    Cancelled { path: PathBuf },
}

impl SyncError {
    /// Wrap an `io::Error` with the operation and the offending path.
    pub fn from_io(err: io::Error, operation: &str, path: &Path) -> Self {
        SyncError::Io {
            path: path.to_path_buf(),
            operation: operation.to_string(),
            source: err,
        }
    }

    pub fn transport(path: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Transport {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn crypto(path: &Path, reason: impl Into<String>) -> Self {
        SyncError::Crypto {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// The path this error is attributed to, when it has one.
    pub fn path(&self) -> Option<String> {
        match self {
            SyncError::Io { path, .. }
            | SyncError::Crypto { path, .. }
            | SyncError::Cancelled { path } => Some(path.display().to_string()),
            SyncError::Transport { path, .. } | SyncError::Timeout { path, .. } => {
                Some(path.clone())
            }
            SyncError::Config(_) | SyncError::Watch(_) => None,
        }
    }

    /// Whether this error came from a permission check.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            SyncError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied
        )
    }
}

/// Attach an operation and path to a raw `io::Result`.
pub(crate) trait IoContext<T> {
    fn with_path(self, operation: &str, path: &Path) -> SyncResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_path(self, operation: &str, path: &Path) -> SyncResult<T> {
        self.map_err(|e| SyncError::from_io(e, operation, path))
    }
}
