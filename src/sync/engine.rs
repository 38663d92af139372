//! Sync engine: one-way mirror of a local tree onto a destination.
//!
//! A run measures the tree, then streams entries from a blocking walker and
//! applies them in traversal order. Parents are always applied before their
//! children. Regular files may be handed to a bounded worker pool; directories
//! and symlinks never are. Nothing is ever deleted at the destination except
//! an entry of the wrong kind standing where a source entry must go.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::CryptoManager;
use crate::error::{IoContext, SyncError, SyncResult};
use crate::fs::backend::{join_remote, RemoteTransport};
use crate::sync::checksum::{ChecksumCalculator, HashType};
use crate::sync::delta::{self, PatchOutcome};
use crate::sync::entry::{self, EntryKind, SyncEntry};
use crate::sync::exclude::IgnoreMatcher;
use crate::sync::progress::ProgressTracker;
use crate::sync::throttle::{BandwidthLimit, BandwidthLimiter};

const ENTRY_CHANNEL_CAPACITY: usize = 256;

/// Tunables for a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub ignore: IgnoreMatcher,
    pub block_size: u64,
    /// Existing destination files at or above this size are patched block by block.
    pub delta_threshold: u64,
    pub hash: HashType,
    /// Concurrent file transfers. 1 keeps the run strictly sequential.
    pub workers: usize,
    pub bandwidth_limit: BandwidthLimit,
    /// Upper bound on each remote transport call.
    pub op_timeout: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_section(&Config::default())
    }
}

impl SyncOptions {
    /// Build options from a validated config.
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self::from_section(config))
    }

    fn from_section(config: &Config) -> Self {
        let sync = &config.sync;
        Self {
            ignore: IgnoreMatcher::from_patterns(&sync.ignore_patterns),
            block_size: sync.block_size,
            delta_threshold: sync.delta_threshold,
            hash: sync.hash,
            workers: sync.workers,
            bandwidth_limit: BandwidthLimit::new(sync.bandwidth_limit),
            op_timeout: sync.op_timeout(),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.block_size == 0 {
            return Err(SyncError::Config("block size must be greater than zero".into()));
        }
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where a sync writes to.
#[derive(Clone)]
pub enum Destination {
    Local(PathBuf),
    Remote {
        transport: Arc<dyn RemoteTransport>,
        /// `/`-separated root on the transport.
        root: String,
    },
}

impl Destination {
    pub fn remote(transport: Arc<dyn RemoteTransport>, root: impl Into<String>) -> Self {
        Destination::Remote {
            transport,
            root: root.into(),
        }
    }

    fn lock_key(&self) -> String {
        match self {
            Destination::Local(path) => format!("local:{}", path.display()),
            Destination::Remote { transport, root } => format!(
                "{}:{}",
                transport.backend_type().short_name(),
                transport.display_path(root)
            ),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local(path) => write!(f, "{}", path.display()),
            Destination::Remote { transport, root } => f.write_str(&transport.display_path(root)),
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local(path) => f.debug_tuple("Local").field(path).finish(),
            Destination::Remote { transport, root } => f
                .debug_struct("Remote")
                .field("backend", &transport.backend_type())
                .field("root", root)
                .finish(),
        }
    }
}

/// Cooperative cancellation, checked between entries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sync statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Files written in full.
    pub files_copied: usize,
    /// Files brought up to date by rewriting differing blocks only.
    pub files_patched: usize,
    /// Files whose destination content already matched.
    pub files_unchanged: usize,
    pub dirs_created: usize,
    pub symlinks_created: usize,
    /// Symlinks the destination transport cannot represent.
    pub symlinks_skipped: usize,
    /// FIFOs, sockets and device nodes found in the source.
    pub special_skipped: usize,
    /// Bytes actually written to the destination.
    pub bytes_transferred: u64,
}

#[derive(Debug, Default)]
struct StatsCounter {
    files_copied: AtomicUsize,
    files_patched: AtomicUsize,
    files_unchanged: AtomicUsize,
    dirs_created: AtomicUsize,
    symlinks_created: AtomicUsize,
    symlinks_skipped: AtomicUsize,
    special_skipped: AtomicUsize,
    bytes_transferred: AtomicU64,
}

impl StatsCounter {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncStats {
        SyncStats {
            files_copied: self.files_copied.load(Ordering::Relaxed),
            files_patched: self.files_patched.load(Ordering::Relaxed),
            files_unchanged: self.files_unchanged.load(Ordering::Relaxed),
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
            symlinks_created: self.symlinks_created.load(Ordering::Relaxed),
            symlinks_skipped: self.symlinks_skipped.load(Ordering::Relaxed),
            special_skipped: self.special_skipped.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub stats: SyncStats,
    /// Bytes of regular files in the (filtered) source tree.
    pub total_bytes: u64,
    pub duration: Duration,
}

type DestinationLock = Arc<tokio::sync::Mutex<()>>;

/// Holds a destination for one run. The map entry goes away with the last
/// holder, so a long-lived engine does not accumulate locks.
struct DestinationLease<'a> {
    locks: &'a Mutex<HashMap<String, DestinationLock>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DestinationLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Orchestrates sync runs. Cheap to share behind an `Arc`.
pub struct SyncEngine {
    options: Arc<SyncOptions>,
    crypto: Option<Arc<CryptoManager>>,
    limiter: BandwidthLimiter,
    cancel: CancelFlag,
    locks: Mutex<HashMap<String, DestinationLock>>,
    progress: watch::Sender<Option<Arc<ProgressTracker>>>,
}

impl SyncEngine {
    pub fn new(options: SyncOptions) -> Self {
        let limiter = BandwidthLimiter::new(options.bandwidth_limit);
        let (progress, _) = watch::channel(None);
        Self {
            options: Arc::new(options),
            crypto: None,
            limiter,
            cancel: CancelFlag::new(),
            locks: Mutex::new(HashMap::new()),
            progress,
        }
    }

    /// Encrypt every file written. Disables change detection.
    pub fn with_crypto(mut self, crypto: Arc<CryptoManager>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Receives the tracker of each run as it starts.
    pub fn subscribe_progress(&self) -> watch::Receiver<Option<Arc<ProgressTracker>>> {
        self.progress.subscribe()
    }

    fn destination_lock(&self, dest: &Destination) -> DestinationLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(dest.lock_key()).or_default())
    }

    async fn lock_destination(&self, dest: &Destination) -> DestinationLease<'_> {
        let guard = self.destination_lock(dest).lock_owned().await;
        DestinationLease {
            locks: &self.locks,
            key: dest.lock_key(),
            guard: Some(guard),
        }
    }

    /// Mirror `source` onto `dest`. Stops at the first error; everything
    /// applied before it stays applied.
    pub async fn sync_directory(&self, source: &Path, dest: &Destination) -> SyncResult<SyncReport> {
        self.options.validate()?;
        let _lease = self.lock_destination(dest).await;
        let started = Instant::now();

        let metadata = tokio::fs::metadata(source)
            .await
            .with_path("reading source root", source)?;
        if !metadata.is_dir() {
            return Err(SyncError::from_io(
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
                "reading source root",
                source,
            ));
        }

        let ignore = Arc::new(self.options.ignore.clone());
        let total = {
            let root = source.to_path_buf();
            let ignore = Arc::clone(&ignore);
            run_blocking(source, move || entry::measure_tree(&root, ignore)).await?
        };

        let tracker = Arc::new(ProgressTracker::new(total));
        self.progress.send_replace(Some(Arc::clone(&tracker)));
        info!(source = %source.display(), dest = %dest, total_bytes = total, "sync started");

        let ctx = Arc::new(ApplyContext {
            options: Arc::clone(&self.options),
            crypto: self.crypto.clone(),
            limiter: self.limiter.clone(),
            calculator: ChecksumCalculator::new(self.options.hash),
            tracker,
            stats: StatsCounter::default(),
            dest: dest.clone(),
        });

        ctx.prepare_root().await?;
        self.apply_tree(source, ignore, &ctx).await?;

        let stats = ctx.stats.snapshot();
        let duration = started.elapsed();
        info!(
            dest = %dest,
            copied = stats.files_copied,
            patched = stats.files_patched,
            unchanged = stats.files_unchanged,
            bytes = stats.bytes_transferred,
            elapsed_ms = duration.as_millis() as u64,
            "sync finished"
        );

        Ok(SyncReport {
            stats,
            total_bytes: total,
            duration,
        })
    }

    async fn apply_tree(
        &self,
        source: &Path,
        ignore: Arc<IgnoreMatcher>,
        ctx: &Arc<ApplyContext>,
    ) -> SyncResult<()> {
        let (tx, mut rx) = mpsc::channel(ENTRY_CHANNEL_CAPACITY);
        let root = source.to_path_buf();
        let walker = tokio::task::spawn_blocking(move || entry::stream_tree(&root, ignore, tx));

        let mut pool = WorkerPool::new(self.options.workers);
        let mut dir_modes = Vec::new();
        let mut first_error = None;

        while let Some(item) = rx.recv().await {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            };
            if self.cancel.is_cancelled() {
                first_error = Some(SyncError::Cancelled {
                    path: entry.relative_path,
                });
                break;
            }

            let applied = match pool.reap() {
                Err(e) => Err(e),
                Ok(()) if matches!(entry.kind, EntryKind::File { .. }) => {
                    pool.submit(Arc::clone(ctx), entry).await
                }
                Ok(()) => match &entry.kind {
                    EntryKind::Directory => ctx.apply_directory(&entry).await.map(|deferred| {
                        dir_modes.extend(deferred);
                    }),
                    EntryKind::Symlink { target } => ctx.apply_symlink(&entry, target).await,
                    EntryKind::Special => {
                        ctx.skip_special(&entry);
                        Ok(())
                    }
                    EntryKind::File { .. } => Ok(()),
                },
            };
            if let Err(e) = applied {
                first_error = Some(e);
                break;
            }
        }

        // Unblocks the walker if it is waiting on a full channel.
        drop(rx);
        let walked = walker
            .await
            .map_err(|e| join_failure(e, source));
        let drained = pool.finish().await;

        if let Some(e) = first_error {
            return Err(e);
        }
        walked?;
        drained?;

        for (path, mode) in dir_modes.into_iter().rev() {
            entry::apply_mode(&path, mode)
                .await
                .with_path("setting permissions on", &path)?;
        }
        Ok(())
    }
}

/// Sync with default options apart from the ignore list and block size.
pub async fn sync_directory(
    source: &Path,
    dest: &Path,
    ignore_patterns: &[String],
    block_size: u64,
    crypto: Option<Arc<CryptoManager>>,
) -> SyncResult<SyncReport> {
    let options = SyncOptions {
        ignore: IgnoreMatcher::from_patterns(ignore_patterns),
        block_size,
        ..SyncOptions::default()
    };
    let mut engine = SyncEngine::new(options);
    if let Some(crypto) = crypto {
        engine = engine.with_crypto(crypto);
    }
    engine
        .sync_directory(source, &Destination::Local(dest.to_path_buf()))
        .await
}

fn join_failure(err: JoinError, path: &Path) -> SyncError {
    SyncError::from_io(io::Error::other(err), "joining worker for", path)
}

async fn run_blocking<T, F>(path: &Path, f: F) -> SyncResult<T>
where
    F: FnOnce() -> SyncResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| join_failure(e, path))?
}

/// Runs file transfers inline (one worker) or on a bounded `JoinSet`.
struct WorkerPool {
    workers: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<SyncResult<()>>,
}

impl WorkerPool {
    fn new(workers: usize) -> Self {
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
        }
    }

    async fn submit(&mut self, ctx: Arc<ApplyContext>, entry: SyncEntry) -> SyncResult<()> {
        if self.workers <= 1 {
            return ctx.apply_file(&entry).await;
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled {
                path: entry.relative_path.clone(),
            })?;
        self.tasks.spawn(async move {
            let _permit = permit;
            ctx.apply_file(&entry).await
        });
        Ok(())
    }

    /// Surface the error of any transfer that already finished.
    fn reap(&mut self) -> SyncResult<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            Self::flatten(joined)?;
        }
        Ok(())
    }

    /// Wait for every in-flight transfer; returns the first error seen.
    async fn finish(mut self) -> SyncResult<()> {
        let mut first = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = Self::flatten(joined) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    fn flatten(joined: Result<SyncResult<()>, JoinError>) -> SyncResult<()> {
        joined.map_err(|e| join_failure(e, Path::new("<transfer>")))?
    }
}

/// Everything one run needs to apply an entry, shared with workers.
struct ApplyContext {
    options: Arc<SyncOptions>,
    crypto: Option<Arc<CryptoManager>>,
    limiter: BandwidthLimiter,
    calculator: ChecksumCalculator,
    tracker: Arc<ProgressTracker>,
    stats: StatsCounter,
    dest: Destination,
}

impl ApplyContext {
    async fn remote_op<T>(&self, path: &str, op: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        match self.options.op_timeout {
            Some(after) => tokio::time::timeout(after, op)
                .await
                .map_err(|_| SyncError::Timeout {
                    path: path.to_string(),
                    after,
                })?,
            None => op.await,
        }
    }

    async fn prepare_root(&self) -> SyncResult<()> {
        match &self.dest {
            Destination::Local(root) => tokio::fs::create_dir_all(root)
                .await
                .with_path("creating destination root", root),
            Destination::Remote { transport, root } => {
                self.remote_op(root, transport.create_directory(root)).await
            }
        }
    }

    /// Ensure the directory exists. Returns the permission bits to apply
    /// once the pass is over.
    async fn apply_directory(&self, entry: &SyncEntry) -> SyncResult<Option<(PathBuf, u32)>> {
        match &self.dest {
            Destination::Local(root) => {
                let path = root.join(&entry.relative_path);
                match tokio::fs::symlink_metadata(&path).await {
                    Ok(meta) if meta.is_dir() => ensure_owner_writable(&path, &meta).await?,
                    Ok(_) => {
                        remove_existing(&path).await?;
                        self.create_local_dir(&path).await?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        self.create_local_dir(&path).await?
                    }
                    Err(e) => return Err(SyncError::from_io(e, "reading metadata of", &path)),
                }
                debug!(path = %entry.relative_path.display(), "directory");
                Ok(Some((path, entry.mode)))
            }
            Destination::Remote { transport, root } => {
                let path = join_remote(root, &entry.relative_slash_path());
                self.remote_op(&path, transport.create_directory(&path)).await?;
                StatsCounter::bump(&self.stats.dirs_created);
                debug!(path = %path, "remote directory");
                Ok(None)
            }
        }
    }

    async fn create_local_dir(&self, path: &Path) -> SyncResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_path("creating directory", path)?;
        StatsCounter::bump(&self.stats.dirs_created);
        Ok(())
    }

    async fn apply_symlink(&self, entry: &SyncEntry, target: &Path) -> SyncResult<()> {
        match &self.dest {
            Destination::Local(root) => {
                let path = root.join(&entry.relative_path);
                if let Ok(existing) = tokio::fs::read_link(&path).await {
                    if existing == target {
                        return Ok(());
                    }
                }
                remove_existing(&path).await?;
                entry::make_symlink(target, &path)
                    .await
                    .with_path("creating symlink", &path)?;
            }
            Destination::Remote { transport, root } => {
                let path = join_remote(root, &entry.relative_slash_path());
                if !transport.capabilities().symlinks {
                    warn!(
                        path = %path,
                        backend = transport.backend_type().short_name(),
                        "transport cannot store symlinks, skipping"
                    );
                    StatsCounter::bump(&self.stats.symlinks_skipped);
                    return Ok(());
                }
                let target = target.to_string_lossy();
                self.remote_op(&path, transport.create_symlink(&target, &path))
                    .await?;
            }
        }
        debug!(path = %entry.relative_path.display(), target = %target.display(), "symlink");
        StatsCounter::bump(&self.stats.symlinks_created);
        Ok(())
    }

    fn skip_special(&self, entry: &SyncEntry) {
        warn!(path = %entry.relative_path.display(), "not a regular file, skipping");
        StatsCounter::bump(&self.stats.special_skipped);
    }

    async fn apply_file(&self, entry: &SyncEntry) -> SyncResult<()> {
        let EntryKind::File { size } = entry.kind else {
            return Ok(());
        };
        match &self.dest {
            Destination::Local(root) => {
                self.transfer_local(entry, size, &root.join(&entry.relative_path))
                    .await?
            }
            Destination::Remote { transport, root } => {
                let path = join_remote(root, &entry.relative_slash_path());
                self.transfer_remote(entry, size, transport.as_ref(), &path)
                    .await?
            }
        }
        // Skips and patches count in full, so a finished run reads 100%.
        self.tracker.advance(size);
        Ok(())
    }

    async fn transfer_local(&self, entry: &SyncEntry, size: u64, dest: &Path) -> SyncResult<()> {
        let source = &entry.source_path;

        match tokio::fs::symlink_metadata(dest).await {
            Ok(meta) if meta.is_file() => {
                ensure_owner_writable(dest, &meta).await?;
                if self.crypto.is_none() {
                    if meta.len() == size && self.same_content(source, dest).await? {
                        entry::apply_mode(dest, entry.mode)
                            .await
                            .with_path("setting permissions on", dest)?;
                        StatsCounter::bump(&self.stats.files_unchanged);
                        debug!(path = %entry.relative_path.display(), "unchanged");
                        return Ok(());
                    }
                    if size >= self.options.delta_threshold && meta.len() > 0 {
                        let outcome = self.patch(source, dest).await?;
                        entry::apply_mode(dest, entry.mode)
                            .await
                            .with_path("setting permissions on", dest)?;
                        StatsCounter::bump(&self.stats.files_patched);
                        self.stats.transferred(outcome.bytes_written);
                        debug!(
                            path = %entry.relative_path.display(),
                            blocks = outcome.blocks_rewritten,
                            "patched"
                        );
                        return Ok(());
                    }
                }
            }
            Ok(_) => remove_existing(dest).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_path("creating directory", parent)?;
                }
            }
            Err(e) => return Err(SyncError::from_io(e, "reading metadata of", dest)),
        }

        self.limiter.acquire(size).await;
        let written = {
            let (src, dst) = (source.clone(), dest.to_path_buf());
            match &self.crypto {
                Some(crypto) => {
                    let crypto = Arc::clone(crypto);
                    run_blocking(source, move || {
                        crypto.encrypt_file(&src, &dst)?;
                        std::fs::metadata(&dst)
                            .map(|m| m.len())
                            .with_path("reading metadata of", &dst)
                    })
                    .await?
                }
                None => {
                    run_blocking(source, move || std::fs::copy(&src, &dst).with_path("copying", &src))
                        .await?
                }
            }
        };
        entry::apply_mode(dest, entry.mode)
            .await
            .with_path("setting permissions on", dest)?;

        StatsCounter::bump(&self.stats.files_copied);
        self.stats.transferred(written);
        debug!(path = %entry.relative_path.display(), bytes = written, "copied");
        Ok(())
    }

    async fn same_content(&self, source: &Path, dest: &Path) -> SyncResult<bool> {
        let source_sum = self.calculator.whole_file_checksum_async(source).await?;
        let dest_sum = self.calculator.whole_file_checksum_async(dest).await?;
        Ok(source_sum.digest == dest_sum.digest)
    }

    async fn patch(&self, source: &Path, dest: &Path) -> SyncResult<PatchOutcome> {
        let calculator = self.calculator;
        let block_size = self.options.block_size;
        let (src, dst) = (source.to_path_buf(), dest.to_path_buf());
        let (source_blocks, dest_blocks) = run_blocking(source, move || {
            Ok((
                calculator.block_checksums(&src, block_size)?,
                calculator.block_checksums(&dst, block_size)?,
            ))
        })
        .await?;

        let pending = source_blocks
            .differing_blocks(&dest_blocks)
            .into_iter()
            .map(|index| {
                let range = source_blocks.block_range(index);
                range.end - range.start
            })
            .sum::<u64>();
        self.limiter.acquire(pending).await;

        let (src, dst) = (source.to_path_buf(), dest.to_path_buf());
        run_blocking(source, move || {
            delta::apply_blocks(&src, &dst, &source_blocks, &dest_blocks)
        })
        .await
    }

    async fn transfer_remote(
        &self,
        entry: &SyncEntry,
        size: u64,
        transport: &dyn RemoteTransport,
        path: &str,
    ) -> SyncResult<()> {
        let source = &entry.source_path;

        if self.crypto.is_none() && transport.capabilities().checksums {
            let existing = self
                .remote_op(path, transport.file_checksum(path, self.calculator.algorithm()))
                .await?;
            if let Some(remote) = existing.filter(|sum| sum.size == size) {
                let local = self.calculator.whole_file_checksum_async(source).await?;
                if local.digest == remote.digest {
                    StatsCounter::bump(&self.stats.files_unchanged);
                    debug!(path = %path, "unchanged");
                    return Ok(());
                }
            }
        }

        let data = match &self.crypto {
            Some(crypto) => {
                let crypto = Arc::clone(crypto);
                let src = source.clone();
                run_blocking(source, move || {
                    let plaintext = std::fs::read(&src).with_path("reading", &src)?;
                    crypto.encrypt_bytes(&plaintext, &src)
                })
                .await?
            }
            None => tokio::fs::read(source).await.with_path("reading", source)?,
        };

        let len = data.len() as u64;
        self.limiter.acquire(len).await;
        self.remote_op(path, transport.write_file(path, data, entry.mode))
            .await?;

        StatsCounter::bump(&self.stats.files_copied);
        self.stats.transferred(len);
        debug!(path = %path, bytes = len, "uploaded");
        Ok(())
    }
}

async fn remove_existing(path: &Path) -> SyncResult<()> {
    entry::remove_existing(path).await.with_path("removing", path)
}

/// A previous run may have left a read-only mode on the destination.
#[cfg(unix)]
async fn ensure_owner_writable(path: &Path, meta: &std::fs::Metadata) -> SyncResult<()> {
    let mode = entry::mode_bits(meta);
    let wanted = if meta.is_dir() { 0o700 } else { 0o600 };
    if mode & wanted == wanted {
        return Ok(());
    }
    entry::apply_mode(path, mode | wanted)
        .await
        .with_path("setting permissions on", path)
}

#[cfg(not(unix))]
async fn ensure_owner_writable(path: &Path, meta: &std::fs::Metadata) -> SyncResult<()> {
    if !meta.permissions().readonly() {
        return Ok(());
    }
    entry::apply_mode(path, 0o644)
        .await
        .with_path("setting permissions on", path)
}
