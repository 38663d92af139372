//! File system watcher with debounced, per-path coalesced events.
//!
//! Raw notifications from `notify` are forwarded from its callback thread into
//! an async coalescing loop. Every notification re-arms a single debounce
//! deadline; when the deadline passes with no further input, one event per
//! distinct path is emitted carrying the most recent kind seen for it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

const RAW_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const ERROR_CHANNEL_CAPACITY: usize = 32;

/// Type of file system change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

impl ChangeKind {
    /// Map a notify kind; access and unclassified events carry no change.
    pub fn from_notify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(ChangeKind::Created),
            EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
            EventKind::Modify(_) => Some(ChangeKind::Modified),
            EventKind::Remove(_) => Some(ChangeKind::Removed),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
        }
    }
}

/// A single pre-debounce notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl RawChange {
    /// One raw change per path of a notify event.
    pub fn from_event(event: Event) -> Vec<Self> {
        let Some(kind) = ChangeKind::from_notify(&event.kind) else {
            return Vec::new();
        };
        event
            .paths
            .into_iter()
            .map(|path| RawChange { path, kind })
            .collect()
    }
}

/// A debounced change, emitted at most once per path per quiet period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// When the last raw notification for this path arrived.
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle of a [`ChangeWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
    Closed,
}

/// Coalesce raw notifications until `shutdown` fires or `raw_rx` closes.
///
/// Pending events are discarded on shutdown. Errors are forwarded as they
/// arrive and never stop the loop; they are dropped if nobody drains them.
pub async fn coalesce_events(
    mut raw_rx: mpsc::Receiver<notify::Result<RawChange>>,
    events_tx: mpsc::Sender<ChangeEvent>,
    errors_tx: mpsc::Sender<SyncError>,
    mut shutdown: oneshot::Receiver<()>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, ChangeEvent> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                debug!(discarded = pending.len(), "watcher loop shutting down");
                return;
            }

            raw = raw_rx.recv() => match raw {
                Some(Ok(change)) => {
                    pending.insert(
                        change.path.clone(),
                        ChangeEvent {
                            path: change.path,
                            kind: change.kind,
                            timestamp: Utc::now(),
                        },
                    );
                    deadline = Some(Instant::now() + debounce);
                }
                Some(Err(e)) => {
                    if errors_tx.try_send(SyncError::Watch(e)).is_err() {
                        warn!("watch error channel full, dropping error");
                    }
                }
                None => return,
            },

            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                deadline = None;
                for (_, event) in pending.drain() {
                    if events_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Watches a directory and delivers debounced [`ChangeEvent`]s.
pub struct ChangeWatcher {
    debounce: Duration,
    state: WatcherState,
    watcher: Option<RecommendedWatcher>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    events_tx: Option<mpsc::Sender<ChangeEvent>>,
    errors_tx: Option<mpsc::Sender<SyncError>>,
    events_rx: Option<mpsc::Receiver<ChangeEvent>>,
    errors_rx: Option<mpsc::Receiver<SyncError>>,
}

impl ChangeWatcher {
    pub fn new(debounce: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            debounce,
            state: WatcherState::Idle,
            watcher: None,
            shutdown: None,
            task: None,
            events_tx: Some(events_tx),
            errors_tx: Some(errors_tx),
            events_rx: Some(events_rx),
            errors_rx: Some(errors_rx),
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Start watching `path`. Must be called from within a Tokio runtime.
    pub fn watch(&mut self, path: &Path, recursive: bool) -> SyncResult<()> {
        if self.state != WatcherState::Idle {
            return Err(SyncError::Config(format!(
                "watcher cannot start while {:?}",
                self.state
            )));
        }
        // Clones go to the loop; the originals stay put until the OS watch is live.
        let (Some(events_tx), Some(errors_tx)) = (self.events_tx.clone(), self.errors_tx.clone())
        else {
            return Err(SyncError::Config("watcher channels already consumed".into()));
        };

        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in RawChange::from_event(event) {
                    if raw_tx.blocking_send(Ok(change)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = raw_tx.blocking_send(Err(e));
            }
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(path, mode)?;
        self.events_tx = None;
        self.errors_tx = None;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.task = Some(tokio::spawn(coalesce_events(
            raw_rx,
            events_tx,
            errors_tx,
            shutdown_rx,
            self.debounce,
        )));
        self.watcher = Some(watcher);
        self.shutdown = Some(shutdown_tx);
        self.state = WatcherState::Watching;
        debug!(path = %path.display(), recursive, "watching");
        Ok(())
    }

    /// Receiver of debounced events. Yields `None` the second time.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ChangeEvent>> {
        self.events_rx.take()
    }

    /// Receiver of watch errors. Yields `None` the second time.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<SyncError>> {
        self.errors_rx.take()
    }

    /// Stop watching. Pending, undelivered events are discarded. Idempotent.
    pub fn close(&mut self) {
        if self.state == WatcherState::Closed {
            return;
        }
        // Dropping the OS watcher first stops new raw input.
        self.watcher = None;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events_tx = None;
        self.errors_tx = None;
        self.state = WatcherState::Closed;
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.close();
    }
}
