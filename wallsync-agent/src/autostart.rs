//! Per-user login autostart via the `Run` registry key.

use std::{io, path::Path};

use thiserror::Error;

pub const RUN_VALUE_NAME: &str = "WallpaperSync";

#[derive(Debug, Error)]
pub enum AutostartError {
    #[error("could not locate the running executable: {0}")]
    CurrentExe(#[source] io::Error),
    #[cfg(target_os = "windows")]
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),
}

#[must_use]
pub fn autostart_command(exe: &Path) -> String {
    format!("\"{}\" run --background", exe.display())
}

pub fn current_exe() -> Result<std::path::PathBuf, AutostartError> {
    std::env::current_exe().map_err(AutostartError::CurrentExe)
}

#[cfg(target_os = "windows")]
mod imp {
    use std::path::Path;

    use super::{AutostartError, autostart_command};
    use crate::registry;

    const RUN_SUBKEY: &str = "Software\\Microsoft\\Windows\\CurrentVersion\\Run";

    pub fn is_enabled(exe: &Path, value_name: &str) -> Result<bool, AutostartError> {
        let expected = autostart_command(exe);
        Ok(registry::get_string(RUN_SUBKEY, value_name)?
            .is_some_and(|value| value.trim() == expected.trim()))
    }

    pub fn set_enabled(exe: &Path, value_name: &str, enabled: bool) -> Result<(), AutostartError> {
        if enabled {
            registry::set_string(RUN_SUBKEY, value_name, &autostart_command(exe))?;
        } else {
            registry::delete_value(RUN_SUBKEY, value_name)?;
        }
        Ok(())
    }
}

#[cfg(not(target_os = "windows"))]
mod imp {
    use std::path::Path;

    use tracing::warn;

    use super::AutostartError;

    pub fn is_enabled(_exe: &Path, _value_name: &str) -> Result<bool, AutostartError> {
        Ok(false)
    }

    pub fn set_enabled(_exe: &Path, _value_name: &str, enabled: bool) -> Result<(), AutostartError> {
        if enabled {
            warn!("autostart is only supported on Windows");
        }
        Ok(())
    }
}

pub use imp::{is_enabled, set_enabled};
