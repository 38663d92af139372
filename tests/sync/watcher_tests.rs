// Tests for the debounced change watcher
// The coalescing loop is driven directly with simulated notifications

use chrono::Utc;
use mirrorsync::sync::watcher::coalesce_events;
use mirrorsync::sync::{ChangeKind, ChangeWatcher, RawChange, WatcherState};
use mirrorsync::SyncError;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};

struct Harness {
    raw_tx: mpsc::Sender<notify::Result<RawChange>>,
    events_rx: mpsc::Receiver<mirrorsync::sync::ChangeEvent>,
    errors_rx: mpsc::Receiver<SyncError>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

fn spawn_loop(debounce: Duration) -> Harness {
    let (raw_tx, raw_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);
    let (errors_tx, errors_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(coalesce_events(raw_rx, events_tx, errors_tx, shutdown_rx, debounce));
    Harness {
        raw_tx,
        events_rx,
        errors_rx,
        shutdown_tx: Some(shutdown_tx),
    }
}

fn change(path: &str, kind: ChangeKind) -> notify::Result<RawChange> {
    Ok(RawChange {
        path: PathBuf::from(path),
        kind,
    })
}

#[tokio::test]
async fn test_burst_collapses_to_one_event() {
    let mut h = spawn_loop(Duration::from_millis(100));

    for _ in 0..4 {
        h.raw_tx.send(change("/w/file.txt", ChangeKind::Modified)).await.unwrap();
        sleep(Duration::from_millis(10)).await;
    }
    let before_last = Utc::now();
    h.raw_tx.send(change("/w/file.txt", ChangeKind::Modified)).await.unwrap();
    let last_sent = Instant::now();

    let event = timeout(Duration::from_secs(2), h.events_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(last_sent.elapsed() >= Duration::from_millis(100));
    assert_eq!(event.path, PathBuf::from("/w/file.txt"));
    assert_eq!(event.kind, ChangeKind::Modified);
    assert!(event.timestamp >= before_last);

    assert!(timeout(Duration::from_millis(250), h.events_rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_latest_kind_wins_per_path() {
    let mut h = spawn_loop(Duration::from_millis(50));

    h.raw_tx.send(change("/w/a", ChangeKind::Created)).await.unwrap();
    h.raw_tx.send(change("/w/b", ChangeKind::Created)).await.unwrap();
    h.raw_tx.send(change("/w/a", ChangeKind::Removed)).await.unwrap();

    let mut events = Vec::new();
    for _ in 0..2 {
        events.push(
            timeout(Duration::from_secs(2), h.events_rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    events.sort_by(|x, y| x.path.cmp(&y.path));

    assert_eq!(events[0].path, PathBuf::from("/w/a"));
    assert_eq!(events[0].kind, ChangeKind::Removed);
    assert_eq!(events[1].kind, ChangeKind::Created);
}

#[tokio::test]
async fn test_shutdown_discards_pending_events() {
    let mut h = spawn_loop(Duration::from_millis(200));

    h.raw_tx.send(change("/w/pending", ChangeKind::Modified)).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    h.shutdown_tx.take().unwrap().send(()).unwrap();

    // The loop exits without flushing, closing the event channel.
    let next = timeout(Duration::from_secs(2), h.events_rx.recv()).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_errors_are_forwarded_without_stopping() {
    let mut h = spawn_loop(Duration::from_millis(30));

    h.raw_tx.send(Err(notify::Error::generic("queue overflow"))).await.unwrap();
    let err = timeout(Duration::from_secs(2), h.errors_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, SyncError::Watch(_)));

    h.raw_tx.send(change("/w/after", ChangeKind::Created)).await.unwrap();
    let event = timeout(Duration::from_secs(2), h.events_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.path, PathBuf::from("/w/after"));
}

#[tokio::test]
async fn test_zero_debounce_still_delivers() {
    let mut h = spawn_loop(Duration::ZERO);
    h.raw_tx.send(change("/w/now", ChangeKind::Modified)).await.unwrap();
    let event = timeout(Duration::from_secs(2), h.events_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.path, PathBuf::from("/w/now"));
}

#[tokio::test]
async fn test_watcher_reports_file_creation() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = ChangeWatcher::new(Duration::from_millis(50));
    let mut events = watcher.take_events().unwrap();
    assert!(watcher.take_events().is_none());

    watcher.watch(dir.path(), true).unwrap();
    std::fs::create_dir_all(dir.path().join("sub")).unwrap();
    sleep(Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("sub/new.txt"), b"hello").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = false;
    while Instant::now() < deadline && !seen {
        if let Ok(Some(event)) = timeout(Duration::from_millis(500), events.recv()).await {
            seen = event.path.ends_with("sub/new.txt");
        }
    }
    assert!(seen, "no event for the created file");

    watcher.close();
    assert_eq!(watcher.state(), WatcherState::Closed);
    let closed = timeout(Duration::from_secs(2), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}
