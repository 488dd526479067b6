//! Storage layout shared by the agent and the widget provider.
//!
//! ```text
//! <base>/WallpaperApp.json   user settings
//! <base>/state.json          runtime state
//! <base>/state.json.lock     state update lock
//! <base>/sync.lock           held while a sync tick runs
//! <base>/logs/               diagnostic logs
//! <base>/wallpapers/         acquired artifacts
//! ```

use std::{
    fs, io,
    path::{Path, PathBuf},
};

pub const DATA_DIR_ENV: &str = "WALLSYNC_DATA_DIR";
const APP_DIR_NAME: &str = "WallpaperSync";
pub const SETTINGS_FILE_NAME: &str = "WallpaperApp.json";
pub const BUNDLED_SETTINGS_FILE_NAME: &str = "wallsync.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    base: PathBuf,
}

impl AppPaths {
    /// Resolves the per-user data directory, honouring `WALLSYNC_DATA_DIR`.
    #[must_use]
    pub fn from_env() -> Self {
        if let Some(override_dir) = std::env::var_os(DATA_DIR_ENV) {
            return Self::with_base(PathBuf::from(override_dir));
        }
        Self::with_base(platform_data_dir().join(APP_DIR_NAME))
    }

    #[must_use]
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.base.join(SETTINGS_FILE_NAME)
    }

    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.base.join("state.json")
    }

    /// Held for the duration of a tick, by whichever process runs it.
    #[must_use]
    pub fn tick_lock_file(&self) -> PathBuf {
        self.base.join("sync.lock")
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    #[must_use]
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.log_dir().join(name)
    }

    #[must_use]
    pub fn artifact_dir(&self) -> PathBuf {
        self.base.join("wallpapers")
    }

    /// Default settings shipped next to the running executable.
    #[must_use]
    pub fn bundled_settings_file() -> Option<PathBuf> {
        let exe = std::env::current_exe().ok()?;
        Some(exe.parent()?.join(BUNDLED_SETTINGS_FILE_NAME))
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base)?;
        fs::create_dir_all(self.log_dir())?;
        fs::create_dir_all(self.artifact_dir())
    }
}

#[cfg(target_os = "windows")]
fn platform_data_dir() -> PathBuf {
    std::env::var_os("LOCALAPPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(not(target_os = "windows"))]
fn platform_data_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local").join("share"))
        .unwrap_or_else(|| PathBuf::from("."))
}
