//! Tree traversal producing one [`SyncEntry`] per filesystem object.
//!
//! The walk runs on a blocking thread and streams entries to the async
//! applier over a bounded channel, so a large tree is never held in memory.
//! Excluded entries are pruned while reading each directory, which also
//! keeps the walk out of excluded subtrees.

use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use jwalk::{Parallelism, WalkDir};
use tokio::sync::mpsc;

use crate::error::{IoContext, SyncError, SyncResult};
use crate::sync::exclude::IgnoreMatcher;

/// Filesystem kind of an entry, with kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { size: u64 },
    Directory,
    /// Target string as stored in the link; never resolved.
    Symlink { target: PathBuf },
    /// FIFO, socket or device node. Never transferred.
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub source_path: PathBuf,
    /// Path under the source root; never empty.
    pub relative_path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits (`0o7777` mask on unix).
    pub mode: u32,
}

impl SyncEntry {
    /// Build an entry from an on-disk path without following symlinks.
    pub fn from_path(root: &Path, path: &Path) -> SyncResult<Self> {
        let metadata = std::fs::symlink_metadata(path).with_path("reading metadata of", path)?;
        let file_type = metadata.file_type();

        let kind = if file_type.is_symlink() {
            let target = std::fs::read_link(path).with_path("reading symlink", path)?;
            EntryKind::Symlink { target }
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File {
                size: metadata.len(),
            }
        } else {
            EntryKind::Special
        };

        let relative_path = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf());

        Ok(Self {
            source_path: path.to_path_buf(),
            relative_path,
            mode: mode_bits(&metadata),
            kind,
        })
    }

    /// Relative path with `/` separators, for remote destinations.
    pub fn relative_slash_path(&self) -> String {
        slash_path(&self.relative_path)
    }
}

pub(crate) fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
pub(crate) fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_bits(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Set permission bits on `path`. Outside unix only the write bit is honoured.
#[cfg(unix)]
pub(crate) async fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
pub(crate) async fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    tokio::fs::set_permissions(path, permissions).await
}

/// Remove whatever stands at `path`. Missing entries are fine.
pub(crate) async fn remove_existing(path: &Path) -> io::Result<()> {
    let removed = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match removed {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
pub(crate) async fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
pub(crate) async fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink_file(target, link).await
}

fn walker(root: &Path, ignore: Arc<IgnoreMatcher>) -> WalkDir {
    let prune_root = root.to_path_buf();
    WalkDir::new(root)
        .sort(true)
        .skip_hidden(false)
        .follow_links(false)
        .parallelism(Parallelism::Serial)
        .process_read_dir(move |_depth, _dir, _state, children| {
            children.retain(|child| match child {
                Ok(entry) => entry
                    .path()
                    .strip_prefix(&prune_root)
                    .map(|relative| !ignore.is_excluded(relative))
                    .unwrap_or(true),
                Err(_) => true,
            });
        })
}

fn walk_error(err: jwalk::Error, root: &Path) -> SyncError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let kind = err.io_error().map(io::Error::kind).unwrap_or(io::ErrorKind::Other);
    SyncError::from_io(io::Error::new(kind, err.to_string()), "walking", &path)
}

/// Sum the sizes of every non-excluded regular file under `root`.
pub fn measure_tree(root: &Path, ignore: Arc<IgnoreMatcher>) -> SyncResult<u64> {
    let mut total = 0u64;
    for entry in walker(root, ignore) {
        let entry = entry.map_err(|e| walk_error(e, root))?;
        if entry.depth == 0 || !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let metadata = std::fs::symlink_metadata(&path).with_path("reading metadata of", &path)?;
        total += metadata.len();
    }
    Ok(total)
}

/// Stream entries under `root` in depth-first order into `tx`. Stops at the
/// first error (which is sent) or when the receiver is dropped.
pub fn stream_tree(root: &Path, ignore: Arc<IgnoreMatcher>, tx: mpsc::Sender<SyncResult<SyncEntry>>) {
    for entry in walker(root, ignore) {
        let item = entry
            .map_err(|e| walk_error(e, root))
            .and_then(|entry| {
                if entry.depth == 0 {
                    Ok(None)
                } else {
                    SyncEntry::from_path(root, &entry.path()).map(Some)
                }
            });

        let failed = item.is_err();
        match item.transpose() {
            Some(item) => {
                if tx.blocking_send(item).is_err() {
                    return;
                }
            }
            None => continue,
        }
        if failed {
            return;
        }
    }
}
