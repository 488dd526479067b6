use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::info;
use wallsync_core::{FitMode, ImageFormat, classify_image_file};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("image file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a PNG, JPEG or BMP image")]
    NotAnImage { path: PathBuf },
    #[cfg(target_os = "windows")]
    #[error("failed to store wallpaper style: {0}")]
    Style(#[from] crate::registry::RegistryError),
    #[error("SystemParametersInfoW failed with OS error {code}")]
    Os { code: i32 },
    #[error("wallpaper backend failed: {0}")]
    Backend(String),
}

/// Paints the desktop background.
pub trait DesktopApplier: Send + Sync {
    fn apply(&self, image: &Path, fit_mode: FitMode) -> Result<(), ApplyError>;
}

impl<T: DesktopApplier + ?Sized> DesktopApplier for Arc<T> {
    fn apply(&self, image: &Path, fit_mode: FitMode) -> Result<(), ApplyError> {
        (**self).apply(image, fit_mode)
    }
}

/// The real desktop of the current user session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDesktop;

impl DesktopApplier for SystemDesktop {
    fn apply(&self, image: &Path, fit_mode: FitMode) -> Result<(), ApplyError> {
        let image = checked_image(image)?;
        platform::apply(&image, fit_mode)?;
        info!(path = %image.display(), %fit_mode, "wallpaper applied");
        Ok(())
    }
}

/// Resolves `image` to an absolute path and re-checks its signature.
pub fn checked_image(image: &Path) -> Result<PathBuf, ApplyError> {
    if !image.is_file() {
        return Err(ApplyError::NotFound(image.to_path_buf()));
    }
    let absolute = std::path::absolute(image).map_err(|source| ApplyError::Io {
        path: image.to_path_buf(),
        source,
    })?;
    match classify_image_file(&absolute) {
        Ok(ImageFormat::Unknown) => Err(ApplyError::NotAnImage { path: absolute }),
        Ok(_) => Ok(absolute),
        Err(source) => Err(ApplyError::Io {
            path: absolute,
            source,
        }),
    }
}

/// `(WallpaperStyle, TileWallpaper)` values under `HKCU\Control Panel\Desktop`.
#[must_use]
pub fn style_values(fit_mode: FitMode) -> (&'static str, &'static str) {
    match fit_mode {
        FitMode::Fill => ("10", "0"),
        FitMode::Fit => ("6", "0"),
        FitMode::Stretch => ("2", "0"),
        FitMode::Tile => ("0", "1"),
        FitMode::Center => ("0", "0"),
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use std::{ffi::c_void, os::windows::ffi::OsStrExt, path::Path};

    use windows_sys::Win32::UI::WindowsAndMessaging::{
        SPI_SETDESKWALLPAPER, SPIF_SENDCHANGE, SPIF_UPDATEINIFILE, SystemParametersInfoW,
    };

    use super::{ApplyError, style_values};
    use crate::registry;
    use wallsync_core::FitMode;

    const DESKTOP_SUBKEY: &str = "Control Panel\\Desktop";

    pub fn apply(image: &Path, fit_mode: FitMode) -> Result<(), ApplyError> {
        let (style, tile) = style_values(fit_mode);
        registry::set_string(DESKTOP_SUBKEY, "WallpaperStyle", style)?;
        registry::set_string(DESKTOP_SUBKEY, "TileWallpaper", tile)?;

        let mut wide: Vec<u16> = image.as_os_str().encode_wide().collect();
        wide.push(0);
        // SAFETY: `wide` is a NUL-terminated path that outlives the call.
        let ok = unsafe {
            SystemParametersInfoW(
                SPI_SETDESKWALLPAPER,
                0,
                wide.as_mut_ptr().cast::<c_void>(),
                SPIF_UPDATEINIFILE | SPIF_SENDCHANGE,
            )
        };
        if ok == 0 {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(ApplyError::Os { code });
        }
        Ok(())
    }
}

#[cfg(not(target_os = "windows"))]
mod platform {
    use std::path::Path;

    use tracing::debug;
    use wallsync_core::FitMode;

    use super::ApplyError;

    fn backend_mode(fit_mode: FitMode) -> wallpaper::Mode {
        match fit_mode {
            FitMode::Fill => wallpaper::Mode::Crop,
            FitMode::Fit => wallpaper::Mode::Fit,
            FitMode::Stretch => wallpaper::Mode::Stretch,
            FitMode::Tile => wallpaper::Mode::Tile,
            FitMode::Center => wallpaper::Mode::Center,
        }
    }

    pub fn apply(image: &Path, fit_mode: FitMode) -> Result<(), ApplyError> {
        // Not every desktop environment supports modes.
        if let Err(err) = wallpaper::set_mode(backend_mode(fit_mode)) {
            debug!(%fit_mode, "wallpaper mode not applied: {err}");
        }
        let path = image
            .to_str()
            .ok_or_else(|| ApplyError::Backend(format!("non UTF-8 path {}", image.display())))?;
        wallpaper::set_from_path(path).map_err(|err| ApplyError::Backend(err.to_string()))
    }
}
