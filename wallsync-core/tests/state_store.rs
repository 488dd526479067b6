use std::{sync::Arc, thread};

use chrono::{Local, TimeZone};
use wallsync_core::{
    SyncState, SyncStateStore,
    state::{MAX_STATE_BYTES, StateLoadError, load_state_from_path},
};

#[test]
fn saved_state_loads_back_field_for_field() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = SyncStateStore::new(dir.path().join("state.json"));

    let state = SyncState {
        is_enabled: false,
        last_known_good_path: Some(dir.path().join("wallpapers").join("wallpaper-1.png")),
        is_first_run: false,
        last_update_time: Some(Local.with_ymd_and_hms(2026, 3, 1, 8, 15, 42).unwrap()),
        success_count: 41,
        failure_count: 3,
    };
    store.save(&state);

    let loaded = store.load();
    assert_eq!(loaded, state);

    let raw = std::fs::read_to_string(store.path()).expect("read state.json");
    assert!(raw.contains("\"LastKnownGoodImagePath\""), "{raw}");
    assert!(raw.contains("\"UpdateSuccessCount\": 41"), "{raw}");
    assert!(raw.contains('\n'), "state file should be indented");
}

#[test]
fn corrupt_state_file_loads_as_default() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("state.json");
    std::fs::write(&path, [0xDE, 0xAD, b'{', b'x']).expect("write garbage");

    assert!(matches!(
        load_state_from_path(&path),
        Err(StateLoadError::Read(_) | StateLoadError::Parse(_))
    ));

    let loaded = SyncStateStore::new(&path).load();
    assert!(loaded.is_enabled);
    assert!(loaded.is_first_run);
    assert_eq!(loaded.success_count, 0);
    assert_eq!(loaded.failure_count, 0);
}

#[test]
fn oversized_state_file_reports_too_large() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("state.json");
    std::fs::write(&path, vec![b'a'; MAX_STATE_BYTES as usize + 1024]).expect("write");

    let err = load_state_from_path(&path).expect_err("oversized file should error");
    assert!(err.to_string().contains("too large"), "unexpected error: {err}");
}

#[test]
fn concurrent_increments_lose_no_updates() {
    const THREADS: usize = 10;
    const PER_THREAD: usize = 10;

    let dir = tempfile::tempdir().expect("create tempdir");
    let store = Arc::new(SyncStateStore::new(dir.path().join("state.json")));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    store.increment_success();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let state = store.load();
    assert_eq!(state.success_count, (THREADS * PER_THREAD) as u64);
    assert_eq!(state.failure_count, 0);
}

#[test]
fn last_known_good_is_usable_only_while_file_exists() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = SyncStateStore::new(dir.path().join("state.json"));
    let artifact = dir.path().join("wallpaper-20260101-000000-000.png");
    std::fs::write(&artifact, [0x42, 0x4D]).expect("write artifact");

    let state = store.update_last_known_good(&artifact);
    assert_eq!(state.usable_last_known_good(), Some(artifact.as_path()));
    assert!(state.last_update_time.is_some());

    std::fs::remove_file(&artifact).expect("remove artifact");
    assert_eq!(store.load().usable_last_known_good(), None);
}

#[test]
fn separate_handles_on_one_file_do_not_lose_updates() {
    const ROUNDS: u64 = 50;
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("state.json");

    let agent = SyncStateStore::new(&path);
    let cli = SyncStateStore::new(&path);
    let successes = thread::spawn(move || {
        for _ in 0..ROUNDS {
            agent.increment_success();
        }
    });
    let failures = thread::spawn(move || {
        for _ in 0..ROUNDS {
            cli.increment_failure();
        }
    });
    successes.join().expect("success writer panicked");
    failures.join().expect("failure writer panicked");

    let state = SyncStateStore::new(&path).load();
    assert_eq!((state.success_count, state.failure_count), (ROUNDS, ROUNDS));
}
