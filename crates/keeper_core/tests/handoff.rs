//! Cross-process access handoff between two repositories on one directory.

use keeper_core::{FileVersion, ManualClock, RepositoryConfig};
use keeper_testkit::{init_tracing, open_lmdb, small_engine_config};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn config() -> RepositoryConfig {
    RepositoryConfig::default()
        .engine(small_engine_config())
        .lock_poll_interval(Duration::from_millis(20))
        .handoff_min_hold(Duration::from_millis(50))
}

#[test]
fn second_repository_waits_for_handoff_and_hands_back() {
    init_tracing();
    let temp = tempdir().unwrap();
    let path = temp.path().join("repo");
    let clock = Arc::new(ManualClock::new(1_000));

    let first = open_lmdb(&path, config(), clock.clone());
    first
        .put_file_version(&FileVersion::new("/a/b.txt", 100, 10))
        .unwrap();

    let (opened_tx, opened_rx) = mpsc::channel();
    let second_path = path.clone();
    let second_clock = clock.clone();
    let second = thread::spawn(move || {
        let second = open_lmdb(&second_path, config(), second_clock);
        opened_tx.send(()).unwrap();
        let seen = second.file_version("/a/b.txt", None).unwrap();
        second
            .put_file_version(&FileVersion::new("/a/b.txt", 200, 20))
            .unwrap();
        second.close().unwrap();
        seen
    });

    opened_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    let seen = second.join().unwrap();
    assert_eq!(seen.map(|v| v.length), Some(10));

    // The first repository reacquires the directory on its next operation.
    let latest = first.file_version("/a/b.txt", None).unwrap().unwrap();
    assert_eq!(latest.length, 20);
    assert_eq!(first.file_versions("/a/b.txt").unwrap().len(), 2);
}

#[test]
fn exclusive_guard_blocks_handoff() {
    init_tracing();
    let temp = tempdir().unwrap();
    let path = temp.path().join("repo");
    let clock = Arc::new(ManualClock::new(1_000));

    let first = open_lmdb(&path, config(), clock.clone());
    let guard = first.acquire_exclusive_lock().unwrap();

    let (opened_tx, opened_rx) = mpsc::channel();
    let second_path = path.clone();
    let waiter = thread::spawn(move || {
        let second = open_lmdb(&second_path, config(), clock);
        opened_tx.send(()).unwrap();
        second.close().unwrap();
    });

    assert!(opened_rx.recv_timeout(Duration::from_millis(400)).is_err());
    first
        .put_file_version(&FileVersion::new("/held", 1, 1))
        .unwrap();
    drop(guard);

    opened_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    waiter.join().unwrap();
    assert!(first.has_file("/held").unwrap());
}
