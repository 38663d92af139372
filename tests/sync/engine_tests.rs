// Tests for the sync engine
// Each test builds a scratch source tree and mirrors it into a scratch destination

use async_trait::async_trait;
use mirrorsync::crypto::CryptoManager;
use mirrorsync::fs::{
    BackendType, LocalTransport, OpendalTransport, RemoteTransport, TransportCapabilities,
};
use mirrorsync::config::RemoteConfig;
use mirrorsync::sync::{
    sync_directory, Destination, IgnoreMatcher, SyncEngine, SyncOptions,
};
use mirrorsync::{SyncError, SyncResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Relative path -> file bytes, or `dir` / `-> target` markers.
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            let meta = fs::symlink_metadata(&path).unwrap();
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&path).unwrap();
                out.insert(rel, format!("-> {}", target.display()).into_bytes());
            } else if meta.is_dir() {
                out.insert(rel, b"dir".to_vec());
                stack.push(path);
            } else {
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    out
}

fn no_ignores() -> SyncOptions {
    SyncOptions {
        ignore: IgnoreMatcher::new(),
        ..SyncOptions::default()
    }
}

fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("docs/notes")).unwrap();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("README.md"), b"# mirror me\n").unwrap();
    fs::write(root.join("docs/guide.txt"), vec![b'g'; 5000]).unwrap();
    fs::write(root.join("docs/notes/today.txt"), b"nothing yet").unwrap();
    fs::write(root.join("src/main.rs"), b"fn main() {}\n").unwrap();
    fs::write(root.join("empty.dat"), b"").unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_end_to_end_file_and_relative_symlink() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    fs::create_dir_all(src.path().join("a/b")).unwrap();
    fs::write(src.path().join("a/f1"), b"0123456789").unwrap();
    std::os::unix::fs::symlink("../f1", src.path().join("a/b/f2")).unwrap();

    let engine = SyncEngine::new(no_ignores());
    let progress = engine.subscribe_progress();
    let report = engine
        .sync_directory(src.path(), &Destination::Local(dst.path().to_path_buf()))
        .await
        .unwrap();

    assert_eq!(fs::read(dst.path().join("a/f1")).unwrap(), b"0123456789");
    assert_eq!(
        fs::read_link(dst.path().join("a/b/f2")).unwrap(),
        Path::new("../f1")
    );
    assert_eq!(report.total_bytes, 10);
    assert_eq!(report.stats.symlinks_created, 1);

    let tracker = progress.borrow().clone().unwrap();
    assert_eq!(tracker.total(), 10);
    assert_eq!(tracker.percent_complete(), 100.0);
}

#[tokio::test]
async fn test_second_run_transfers_nothing() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    build_tree(src.path());

    let engine = SyncEngine::new(no_ignores());
    let dest = Destination::Local(dst.path().to_path_buf());

    let first = engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(first.stats.files_copied, 5);
    assert_eq!(first.stats.bytes_transferred, first.total_bytes);
    let after_first = snapshot(dst.path());
    assert_eq!(after_first, snapshot(src.path()));

    let second = engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(second.stats.bytes_transferred, 0);
    assert_eq!(second.stats.files_copied, 0);
    assert_eq!(second.stats.files_unchanged, 5);
    assert_eq!(second.stats.dirs_created, 0);
    assert_eq!(snapshot(dst.path()), after_first);
}

#[tokio::test]
async fn test_large_file_change_rewrites_only_changed_block() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    let mut data: Vec<u8> = (0..64 * 1024).map(|i| (i % 253) as u8).collect();
    fs::write(src.path().join("big.bin"), &data).unwrap();

    let options = SyncOptions {
        delta_threshold: 16 * 1024,
        ..no_ignores()
    };
    let engine = SyncEngine::new(options);
    let dest = Destination::Local(dst.path().to_path_buf());
    engine.sync_directory(src.path(), &dest).await.unwrap();

    data[5 * 4096 + 17] ^= 0x5a;
    fs::write(src.path().join("big.bin"), &data).unwrap();

    let report = engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(report.stats.files_patched, 1);
    assert_eq!(report.stats.bytes_transferred, 4096);
    assert_eq!(fs::read(dst.path().join("big.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_shrunk_large_file_is_truncated() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    let data: Vec<u8> = (0..40_000).map(|i| (i % 97) as u8).collect();
    fs::write(src.path().join("log.bin"), &data).unwrap();

    let engine = SyncEngine::new(SyncOptions {
        delta_threshold: 1024,
        ..no_ignores()
    });
    let dest = Destination::Local(dst.path().to_path_buf());
    engine.sync_directory(src.path(), &dest).await.unwrap();

    fs::write(src.path().join("log.bin"), &data[..30_000]).unwrap();
    engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(fs::read(dst.path().join("log.bin")).unwrap(), &data[..30_000]);
}

#[tokio::test]
async fn test_ignored_entries_are_not_mirrored() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    build_tree(src.path());
    fs::create_dir_all(src.path().join(".git/objects")).unwrap();
    fs::write(src.path().join(".git/objects/abc"), vec![0u8; 1000]).unwrap();
    fs::write(src.path().join("docs/draft.tmp"), b"scratch").unwrap();
    fs::write(src.path().join("src/.main.rs.swp"), b"swap").unwrap();

    let report = sync_directory(
        src.path(),
        dst.path(),
        &[".git/".to_string(), "*.tmp".to_string(), "*.swp".to_string()],
        4096,
        None,
    )
    .await
    .unwrap();

    assert!(!dst.path().join(".git").exists());
    assert!(!dst.path().join("docs/draft.tmp").exists());
    assert!(!dst.path().join("src/.main.rs.swp").exists());
    assert!(dst.path().join("docs/guide.txt").exists());
    // Excluded bytes do not count towards the total.
    assert_eq!(report.total_bytes, 12 + 5000 + 11 + 13);
}

#[tokio::test]
async fn test_encrypted_sync_decrypts_to_source() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    build_tree(src.path());
    let crypto = Arc::new(CryptoManager::from_key([42u8; 32]));

    let engine = SyncEngine::new(no_ignores()).with_crypto(Arc::clone(&crypto));
    let dest = Destination::Local(dst.path().to_path_buf());
    engine.sync_directory(src.path(), &dest).await.unwrap();

    let sealed = fs::read(dst.path().join("src/main.rs")).unwrap();
    assert_ne!(sealed, b"fn main() {}\n");
    let opened = crypto
        .decrypt_bytes(&sealed, Path::new("src/main.rs"))
        .unwrap();
    assert_eq!(opened, b"fn main() {}\n");

    // Ciphertext never matches plaintext, so every file is written again.
    let second = engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(second.stats.files_copied, 5);
    assert_eq!(second.stats.files_unchanged, 0);
}

#[tokio::test]
async fn test_cancelled_run_names_next_entry() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    build_tree(src.path());

    let engine = SyncEngine::new(no_ignores());
    engine.cancel_flag().cancel();

    let err = engine
        .sync_directory(src.path(), &Destination::Local(dst.path().join("out")))
        .await
        .unwrap_err();

    match err {
        SyncError::Cancelled { path } => assert_eq!(path, Path::new("README.md")),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(snapshot(&dst.path().join("out")).is_empty());
}

#[tokio::test]
async fn test_worker_pool_copies_every_file() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    for dir in 0..5 {
        let sub = src.path().join(format!("dir{dir}"));
        fs::create_dir_all(&sub).unwrap();
        for file in 0..10 {
            fs::write(sub.join(format!("file{file}.txt")), format!("{dir}-{file}").repeat(100)).unwrap();
        }
    }

    let engine = SyncEngine::new(SyncOptions {
        workers: 4,
        ..no_ignores()
    });
    let progress = engine.subscribe_progress();
    let report = engine
        .sync_directory(src.path(), &Destination::Local(dst.path().to_path_buf()))
        .await
        .unwrap();

    assert_eq!(report.stats.files_copied, 50);
    assert_eq!(report.stats.dirs_created, 5);
    assert_eq!(snapshot(dst.path()), snapshot(src.path()));
    assert_eq!(progress.borrow().clone().unwrap().completed(), report.total_bytes);
}

#[tokio::test]
async fn test_concurrent_runs_to_same_destination_are_serialized() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    build_tree(src.path());

    let engine = Arc::new(SyncEngine::new(no_ignores()));
    let dest = Destination::Local(dst.path().to_path_buf());
    let (a, b) = tokio::join!(
        engine.sync_directory(src.path(), &dest),
        engine.sync_directory(src.path(), &dest)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one of the two did the copying.
    assert_eq!(a.stats.files_copied + b.stats.files_copied, 5);
    assert_eq!(a.stats.files_unchanged + b.stats.files_unchanged, 5);
}

#[tokio::test]
async fn test_file_replaces_directory_of_same_name() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    fs::write(src.path().join("config"), b"now a file").unwrap();
    fs::create_dir_all(dst.path().join("config/old")).unwrap();

    let engine = SyncEngine::new(no_ignores());
    engine
        .sync_directory(src.path(), &Destination::Local(dst.path().to_path_buf()))
        .await
        .unwrap();
    assert_eq!(fs::read(dst.path().join("config")).unwrap(), b"now a file");
}

#[cfg(unix)]
#[tokio::test]
async fn test_permission_bits_are_preserved() {
    use std::os::unix::fs::PermissionsExt;

    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    fs::create_dir_all(src.path().join("locked")).unwrap();
    fs::write(src.path().join("locked/readonly.txt"), b"v1").unwrap();
    fs::write(src.path().join("run.sh"), b"#!/bin/sh\n").unwrap();
    fs::set_permissions(src.path().join("run.sh"), fs::Permissions::from_mode(0o750)).unwrap();
    fs::set_permissions(src.path().join("locked/readonly.txt"), fs::Permissions::from_mode(0o444)).unwrap();
    fs::set_permissions(src.path().join("locked"), fs::Permissions::from_mode(0o555)).unwrap();

    let engine = SyncEngine::new(no_ignores());
    let dest = Destination::Local(dst.path().to_path_buf());
    engine.sync_directory(src.path(), &dest).await.unwrap();

    let mode = |p: &str| fs::metadata(dst.path().join(p)).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode("run.sh"), 0o750);
    assert_eq!(mode("locked/readonly.txt"), 0o444);
    assert_eq!(mode("locked"), 0o555);

    // Read-only destination entries from the previous run must not block an update.
    fs::set_permissions(src.path().join("locked"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::set_permissions(src.path().join("locked/readonly.txt"), fs::Permissions::from_mode(0o644)).unwrap();
    fs::write(src.path().join("locked/readonly.txt"), b"v2").unwrap();
    fs::set_permissions(src.path().join("locked/readonly.txt"), fs::Permissions::from_mode(0o444)).unwrap();
    fs::set_permissions(src.path().join("locked"), fs::Permissions::from_mode(0o555)).unwrap();

    engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(fs::read(dst.path().join("locked/readonly.txt")).unwrap(), b"v2");

    // Let tempdir clean up.
    fs::set_permissions(src.path().join("locked"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::set_permissions(dst.path().join("locked"), fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_remote_destination_through_local_transport() {
    let src = tempdir().unwrap();
    let remote = tempdir().unwrap();
    build_tree(src.path());
    std::os::unix::fs::symlink("README.md", src.path().join("readme-link")).unwrap();

    let transport = Arc::new(LocalTransport::new(remote.path().to_path_buf()));
    let dest = Destination::remote(transport, "mirror");
    let engine = SyncEngine::new(no_ignores());

    let first = engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(first.stats.files_copied, 5);
    assert_eq!(first.stats.symlinks_created, 1);
    assert_eq!(snapshot(&remote.path().join("mirror")), snapshot(src.path()));

    let second = engine.sync_directory(src.path(), &dest).await.unwrap();
    assert_eq!(second.stats.bytes_transferred, 0);
    assert_eq!(second.stats.files_unchanged, 5);
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinks_skipped_on_object_store() {
    let src = tempdir().unwrap();
    let remote = tempdir().unwrap();
    fs::write(src.path().join("data.txt"), b"payload").unwrap();
    std::os::unix::fs::symlink("data.txt", src.path().join("alias")).unwrap();

    let transport = OpendalTransport::from_config(&RemoteConfig::Fs {
        root: remote.path().to_path_buf(),
    })
    .unwrap();
    let dest = Destination::remote(Arc::new(transport), "backup");
    let report = SyncEngine::new(no_ignores())
        .sync_directory(src.path(), &dest)
        .await
        .unwrap();

    assert_eq!(report.stats.symlinks_skipped, 1);
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(
        fs::read(remote.path().join("backup/data.txt")).unwrap(),
        b"payload"
    );
    assert!(!remote.path().join("backup/alias").exists());
}

/// Local transport that refuses to write one file.
struct RefusingTransport {
    inner: LocalTransport,
    refuse: &'static str,
}

#[async_trait]
impl RemoteTransport for RefusingTransport {
    async fn create_directory(&self, path: &str) -> SyncResult<()> {
        self.inner.create_directory(path).await
    }

    async fn write_file(&self, path: &str, data: Vec<u8>, mode: u32) -> SyncResult<()> {
        if path.ends_with(self.refuse) {
            return Err(SyncError::transport(path, "quota exceeded"));
        }
        self.inner.write_file(path, data, mode).await
    }

    async fn create_symlink(&self, target: &str, path: &str) -> SyncResult<()> {
        self.inner.create_symlink(target, path).await
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::local()
    }
}

#[tokio::test]
async fn test_failure_mid_walk_keeps_earlier_entries() {
    let src = tempdir().unwrap();
    let remote = tempdir().unwrap();
    fs::create_dir_all(src.path().join("b")).unwrap();
    fs::write(src.path().join("a.txt"), b"first").unwrap();
    fs::write(src.path().join("b/broken.txt"), b"refused").unwrap();
    fs::write(src.path().join("c.txt"), b"never reached").unwrap();

    let transport = RefusingTransport {
        inner: LocalTransport::new(remote.path().to_path_buf()),
        refuse: "broken.txt",
    };
    let dest = Destination::remote(Arc::new(transport), "mirror");
    let err = SyncEngine::new(no_ignores())
        .sync_directory(src.path(), &dest)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Transport { .. }));
    assert_eq!(err.path().as_deref(), Some("mirror/b/broken.txt"));

    let mirror = remote.path().join("mirror");
    assert_eq!(fs::read(mirror.join("a.txt")).unwrap(), b"first");
    assert!(mirror.join("b").is_dir());
    assert!(!mirror.join("b/broken.txt").exists());
    assert!(!mirror.join("c.txt").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_fifos_and_sockets_are_skipped() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    fs::write(src.path().join("a.txt"), b"before").unwrap();
    fs::write(src.path().join("z.txt"), b"after").unwrap();
    let status = std::process::Command::new("mkfifo")
        .arg(src.path().join("pipe"))
        .status()
        .unwrap();
    assert!(status.success());
    let _listener = std::os::unix::net::UnixListener::bind(src.path().join("sock")).unwrap();

    let engine = SyncEngine::new(no_ignores());
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        engine.sync_directory(src.path(), &Destination::Local(dst.path().to_path_buf())),
    )
    .await
    .expect("sync blocked on a special file")
    .unwrap();

    assert_eq!(report.stats.special_skipped, 2);
    assert_eq!(report.stats.files_copied, 2);
    assert_eq!(report.total_bytes, 11);
    assert_eq!(fs::read(dst.path().join("z.txt")).unwrap(), b"after");
    assert!(fs::symlink_metadata(dst.path().join("pipe")).is_err());
    assert!(fs::symlink_metadata(dst.path().join("sock")).is_err());
}
