use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{SyncState, lock::FileLock};

/// `state.json` is expected to be tiny; anything larger is treated as corrupt.
pub const MAX_STATE_BYTES: u64 = 64 * 1024;

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_BACKOFF_BASE_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum StateLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StateSaveError {
    #[error("create dir {path} failed: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub fn load_state_from_path(path: &Path) -> Result<SyncState, StateLoadError> {
    let meta = fs::metadata(path).map_err(StateLoadError::Metadata)?;
    if meta.len() > MAX_STATE_BYTES {
        return Err(StateLoadError::TooLarge {
            size: meta.len(),
            max: MAX_STATE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(StateLoadError::Read)?;
    serde_json::from_str(&data).map_err(StateLoadError::Parse)
}

pub fn save_state_to_path(path: &Path, state: &SyncState) -> Result<(), StateSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(state).map_err(StateSaveError::Serialize)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StateSaveError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(&tmp, payload.as_bytes()).map_err(StateSaveError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(StateSaveError::Rename)
}

/// Durable runtime state with load/mutate/save under one critical section.
///
/// The section is held by an in-process mutex plus an exclusive lock on
/// `<state>.lock`, so the agent, the CLI and the widget provider can all
/// update the same file. Load never fails outward: a missing, oversized or unparsable file yields
/// [`SyncState::default`]. Save failures are logged and swallowed after the
/// retry budget is spent.
#[derive(Debug)]
pub struct SyncStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

impl SyncStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> SyncState {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_unlocked()
    }

    pub fn save(&self, state: &SyncState) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = self.file_lock();
        self.save_unlocked(state);
    }

    /// Runs `mutate` against the current record and persists the result, all
    /// inside the store's critical section. Returns the saved record.
    pub fn update(&self, mutate: impl FnOnce(&mut SyncState)) -> SyncState {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = self.file_lock();
        let mut state = self.load_unlocked();
        mutate(&mut state);
        self.save_unlocked(&state);
        state
    }

    pub fn update_last_known_good(&self, path: &Path) -> SyncState {
        self.update(|state| {
            state.last_known_good_path = Some(path.to_path_buf());
            state.last_update_time = Some(Local::now());
        })
    }

    pub fn set_enabled(&self, enabled: bool) -> SyncState {
        self.update(|state| state.is_enabled = enabled)
    }

    pub fn mark_first_run_complete(&self) -> SyncState {
        self.update(|state| state.is_first_run = false)
    }

    pub fn increment_success(&self) -> SyncState {
        self.update(|state| {
            state.success_count = state.success_count.saturating_add(1);
            state.last_update_time = Some(Local::now());
        })
    }

    pub fn increment_failure(&self) -> SyncState {
        self.update(|state| state.failure_count = state.failure_count.saturating_add(1))
    }

    /// The fetch failed but the previous artifact was re-applied.
    pub fn record_fallback_applied(&self) -> SyncState {
        self.update(|state| {
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_update_time = Some(Local::now());
        })
    }

    pub fn reset_counters(&self) -> SyncState {
        self.update(|state| {
            state.success_count = 0;
            state.failure_count = 0;
        })
    }

    /// Falls back to the in-process mutex alone when the lock file is unusable.
    fn file_lock(&self) -> Option<FileLock> {
        match FileLock::acquire(&self.lock_path) {
            Ok(lock) => Some(lock),
            Err(err) => {
                warn!(path = %self.lock_path.display(), "state lock unavailable: {err}");
                None
            }
        }
    }

    fn load_unlocked(&self) -> SyncState {
        match load_state_from_path(&self.path) {
            Ok(state) => state,
            Err(StateLoadError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file yet, using defaults");
                SyncState::default()
            }
            Err(err) => {
                warn!(path = %self.path.display(), "state load failed, using defaults: {err}");
                SyncState::default()
            }
        }
    }

    fn save_unlocked(&self, state: &SyncState) {
        let mut last_err = None;
        for attempt in 1..=SAVE_ATTEMPTS {
            match save_state_to_path(&self.path, state) {
                Ok(()) => return,
                Err(err) => {
                    last_err = Some(err);
                    if attempt < SAVE_ATTEMPTS {
                        let backoff_ms = SAVE_BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                    }
                }
            }
        }
        if let Some(err) = last_err {
            warn!(path = %self.path.display(), "state save failed after {SAVE_ATTEMPTS} attempts: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load(), SyncState::default());
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, vec![b' '; (MAX_STATE_BYTES + 1) as usize]).unwrap();
        assert!(matches!(
            load_state_from_path(&path),
            Err(StateLoadError::TooLarge { .. })
        ));
        assert_eq!(SyncStateStore::new(&path).load(), SyncState::default());
    }

    #[test]
    fn save_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = SyncStateStore::new(&path);
        store.set_enabled(false);
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert!(!store.load().is_enabled);
    }

    #[test]
    fn save_reports_uncreatable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let err = save_state_to_path(&blocker.join("state.json"), &SyncState::default())
            .unwrap_err();
        assert!(
            matches!(&err, StateSaveError::CreateDir { path, .. } if *path == blocker),
            "{err}"
        );
    }

    #[test]
    fn fallback_counts_as_failure_but_stamps_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::new(dir.path().join("state.json"));
        let state = store.record_fallback_applied();
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.success_count, 0);
        assert!(state.last_update_time.is_some());

        let state = store.increment_failure();
        assert_eq!(state.failure_count, 2);
    }

    #[test]
    fn reset_counters_keeps_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::new(dir.path().join("state.json"));
        store.increment_success();
        store.increment_failure();
        store.mark_first_run_complete();

        let state = store.reset_counters();
        assert_eq!((state.success_count, state.failure_count), (0, 0));
        assert!(!state.is_first_run);
        assert!(state.last_update_time.is_some());
    }
}
