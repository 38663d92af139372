//! Sync engine, change detection and filesystem watching.

pub mod checksum;
pub mod delta;
pub mod engine;
pub mod entry;
pub mod exclude;
pub mod progress;
pub mod throttle;
pub mod watcher;

pub use checksum::{BlockChecksum, ChecksumCalculator, Digest, FileChecksum, HashType};
pub use engine::{
    sync_directory, CancelFlag, Destination, SyncEngine, SyncOptions, SyncReport, SyncStats,
};
pub use entry::{EntryKind, SyncEntry};
pub use exclude::{is_excluded, IgnoreMatcher, IGNORE_FILE_NAME};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use throttle::{BandwidthLimit, BandwidthLimiter};
pub use watcher::{ChangeEvent, ChangeKind, ChangeWatcher, RawChange, WatcherState};
