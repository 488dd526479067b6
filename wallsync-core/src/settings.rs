use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{Settings, SourceKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file {0} not found and no bundled default to seed it from")]
    Missing(PathBuf),
    #[error("failed to seed settings from {from}: {source}")]
    Seed { from: PathBuf, source: io::Error },
    #[error("failed to read settings {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("AppSettings section not found in {0}")]
    MissingSection(PathBuf),
    #[error("ImageUrl cannot be empty")]
    EmptyImageUrl,
    #[error("ImageUrl is not a valid absolute URL: {0}")]
    InvalidImageUrl(String),
    #[error("ImageUrl must use HTTPS")]
    InsecureImageUrl,
    #[error("LocalImagePath is required when SourceType is LocalFile")]
    MissingLocalPath,
    #[error("local image file not found: {0}")]
    LocalFileNotFound(PathBuf),
    #[error("RefreshIntervalMinutes must be at least 1")]
    InvalidInterval,
    #[error("failed to serialize settings: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write settings {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(rename = "AppSettings", default)]
    app_settings: Option<Settings>,
}

impl Settings {
    /// Checks the invariants for the selected source.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_minutes < 1 {
            return Err(ConfigError::InvalidInterval);
        }

        match self.source_kind {
            SourceKind::Url => {
                let raw = self.image_url.trim();
                if raw.is_empty() {
                    return Err(ConfigError::EmptyImageUrl);
                }
                let url =
                    Url::parse(raw).map_err(|err| ConfigError::InvalidImageUrl(err.to_string()))?;
                if url.scheme() != "https" {
                    return Err(ConfigError::InsecureImageUrl);
                }
            }
            SourceKind::LocalFile => {
                let path = self
                    .local_image_path
                    .as_deref()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or(ConfigError::MissingLocalPath)?;
                if !path.is_file() {
                    return Err(ConfigError::LocalFileNotFound(path.to_path_buf()));
                }
            }
        }
        Ok(())
    }
}

/// User settings file, seeded once from a bundled default copy.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    bundled_default: Option<PathBuf>,
}

impl SettingsStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bundled_default: None,
        }
    }

    #[must_use]
    pub fn with_bundled_default(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundled_default = Some(path.into());
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies the bundled default into place when no user copy exists yet.
    ///
    /// Returns `true` when a copy was made.
    pub fn seed_if_missing(&self) -> Result<bool, ConfigError> {
        if self.path.exists() {
            return Ok(false);
        }
        let Some(bundled) = self.bundled_default.as_deref().filter(|p| p.is_file()) else {
            return Ok(false);
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Seed {
                from: bundled.to_path_buf(),
                source,
            })?;
        }
        fs::copy(bundled, &self.path).map_err(|source| ConfigError::Seed {
            from: bundled.to_path_buf(),
            source,
        })?;
        info!(from = %bundled.display(), to = %self.path.display(), "seeded user settings");
        Ok(true)
    }

    /// Parses the user settings without validating them.
    pub fn read(&self) -> Result<Settings, ConfigError> {
        self.seed_if_missing()?;
        if !self.path.exists() {
            return Err(ConfigError::Missing(self.path.clone()));
        }

        let data = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        let file: SettingsFile =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        file.app_settings
            .ok_or_else(|| ConfigError::MissingSection(self.path.clone()))
    }

    /// Reads and validates the user settings.
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let settings = self.read()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        let file = SettingsFile {
            app_settings: Some(settings.clone()),
        };
        let payload = serde_json::to_string_pretty(&file).map_err(ConfigError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("json.tmp");
        let write = |target: &Path| -> io::Result<()> {
            fs::write(&tmp, payload.as_bytes())?;
            fs::rename(&tmp, target)
        };
        write(&self.path).map_err(|source| {
            warn!(path = %self.path.display(), "settings save failed: {source}");
            ConfigError::Write {
                path: self.path.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FitMode;

    const SAMPLE: &str = r#"{
  "AppSettings": {
    "ImageUrl": "https://example.com/wallpaper.png",
    "RefreshIntervalMinutes": 30,
    "FitMode": 1,
    "EnableNotifications": false,
    "LocalImagePath": null,
    "SourceType": 0
  }
}"#;

    #[test]
    fn seeds_user_copy_once_then_user_copy_wins() {
        let dir = tempfile::tempdir().unwrap();
        let bundled = dir.path().join("bundled.json");
        fs::write(&bundled, SAMPLE).unwrap();
        let store = SettingsStore::new(dir.path().join("user").join("WallpaperApp.json"))
            .with_bundled_default(&bundled);

        let settings = store.load().unwrap();
        assert_eq!(settings.refresh_interval_minutes, 30);
        assert_eq!(settings.fit_mode, FitMode::Fit);
        assert!(!settings.enable_notifications);
        assert!(store.path().exists());

        let changed = Settings {
            refresh_interval_minutes: 5,
            ..settings
        };
        store.save(&changed).unwrap();
        fs::write(&bundled, SAMPLE.replace("30", "99")).unwrap();
        assert!(!store.seed_if_missing().unwrap());
        assert_eq!(store.load().unwrap().refresh_interval_minutes, 5);
    }

    #[test]
    fn missing_file_without_bundle_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("WallpaperApp.json"));
        assert!(matches!(store.load(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn missing_section_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WallpaperApp.json");
        fs::write(&path, r#"{"Other": {}}"#).unwrap();
        let store = SettingsStore::new(&path);
        assert!(matches!(store.load(), Err(ConfigError::MissingSection(_))));
    }

    #[test]
    fn url_mode_requires_https() {
        let mut settings = Settings {
            image_url: "http://example.com/a.png".to_owned(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InsecureImageUrl)
        ));

        settings.image_url = "   ".to_owned();
        assert!(matches!(settings.validate(), Err(ConfigError::EmptyImageUrl)));

        settings.image_url = "wallpaper.png".to_owned();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidImageUrl(_))
        ));

        settings.image_url = "https://example.com/a.png".to_owned();
        settings.validate().unwrap();

        settings.refresh_interval_minutes = 0;
        assert!(matches!(settings.validate(), Err(ConfigError::InvalidInterval)));
    }

    #[test]
    fn local_mode_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            source_kind: SourceKind::LocalFile,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::MissingLocalPath)));

        let image = dir.path().join("photo.png");
        settings.local_image_path = Some(image.clone());
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::LocalFileNotFound(_))
        ));

        fs::write(&image, [0x42, 0x4D]).unwrap();
        settings.validate().unwrap();
    }
}
