use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, TimeZone};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod channel;
pub mod lock;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod state;

pub use channel::{ChannelError, ChannelListener, NotificationChannel};
pub use paths::AppPaths;
pub use settings::{ConfigError, SettingsStore};
pub use state::SyncStateStore;

/// Name of the system-wide auto-reset event shared by producer and consumers.
///
/// The `Global\` prefix makes the event visible across Windows sessions.
pub const REFRESH_CHANNEL_NAME: &str = "Global\\WallpaperSyncWidgetRefresh";
/// Raised by widgets and the CLI to ask a running agent for an immediate sync.
pub const SYNC_REQUEST_CHANNEL_NAME: &str = "Global\\WallpaperSyncRequest";
pub const DEFAULT_REFRESH_INTERVAL_MINUTES: u32 = 15;
pub const ARTIFACT_PREFIX: &str = "wallpaper-";
pub const ARTIFACT_SUFFIX: &str = ".png";
const ARTIFACT_SECONDS_FORMAT: &str = "%Y%m%d-%H%M%S";

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];
const BMP_SIGNATURE: [u8; 2] = [0x42, 0x4D];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Bmp,
    Unknown,
}

impl ImageFormat {
    #[must_use]
    pub fn is_known(self) -> bool {
        self != ImageFormat::Unknown
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Bmp => "BMP",
            ImageFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Classifies a byte prefix by magic-byte signature.
///
/// Signatures are checked PNG, then JPEG, then BMP against however many bytes are
/// present. Anything shorter than two bytes is `Unknown`.
#[must_use]
pub fn classify_image(bytes: &[u8]) -> ImageFormat {
    if bytes.len() < BMP_SIGNATURE.len() {
        return ImageFormat::Unknown;
    }
    if bytes.starts_with(&PNG_SIGNATURE) {
        ImageFormat::Png
    } else if bytes.starts_with(&JPEG_SIGNATURE) {
        ImageFormat::Jpeg
    } else if bytes.starts_with(&BMP_SIGNATURE) {
        ImageFormat::Bmp
    } else {
        ImageFormat::Unknown
    }
}

/// Reads the leading bytes of `path` and classifies them.
pub fn classify_image_file(path: &Path) -> io::Result<ImageFormat> {
    let mut header = Vec::with_capacity(PNG_SIGNATURE.len());
    File::open(path)?
        .take(PNG_SIGNATURE.len() as u64)
        .read_to_end(&mut header)?;
    Ok(classify_image(&header))
}

/// `wallpaper-{yyyyMMdd-HHmmss-fff}.png` for the given acquisition time.
#[must_use]
pub fn artifact_file_name(acquired_at: &DateTime<Local>) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}-{:03}{ARTIFACT_SUFFIX}",
        acquired_at.format(ARTIFACT_SECONDS_FORMAT),
        acquired_at.timestamp_subsec_millis()
    )
}

#[must_use]
pub fn is_artifact_file_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(ARTIFACT_SUFFIX)
}

/// Recovers the acquisition time encoded by [`artifact_file_name`].
#[must_use]
pub fn parse_artifact_timestamp(name: &str) -> Option<DateTime<Local>> {
    let stem = name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_SUFFIX)?;
    let (seconds_part, millis_part) = stem.rsplit_once('-')?;
    if millis_part.len() != 3 {
        return None;
    }
    let millis: i64 = millis_part.parse().ok()?;
    let naive = NaiveDateTime::parse_from_str(seconds_part, ARTIFACT_SECONDS_FORMAT).ok()?;
    let naive = naive.checked_add_signed(TimeDelta::milliseconds(millis))?;
    Local.from_local_datetime(&naive).earliest()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SourceKind {
    #[default]
    Url,
    LocalFile,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum FitMode {
    #[default]
    Fill,
    Fit,
    Stretch,
    Tile,
    Center,
}

#[derive(Debug, Error)]
#[error("{kind} value {value} is out of range")]
pub struct EnumRangeError {
    kind: &'static str,
    value: i64,
}

impl TryFrom<i64> for SourceKind {
    type Error = EnumRangeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SourceKind::Url),
            1 => Ok(SourceKind::LocalFile),
            _ => Err(EnumRangeError {
                kind: "SourceType",
                value,
            }),
        }
    }
}

impl From<SourceKind> for i64 {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Url => 0,
            SourceKind::LocalFile => 1,
        }
    }
}

impl TryFrom<i64> for FitMode {
    type Error = EnumRangeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FitMode::Fill),
            1 => Ok(FitMode::Fit),
            2 => Ok(FitMode::Stretch),
            3 => Ok(FitMode::Tile),
            4 => Ok(FitMode::Center),
            _ => Err(EnumRangeError {
                kind: "FitMode",
                value,
            }),
        }
    }
}

impl From<FitMode> for i64 {
    fn from(mode: FitMode) -> Self {
        match mode {
            FitMode::Fill => 0,
            FitMode::Fit => 1,
            FitMode::Stretch => 2,
            FitMode::Tile => 3,
            FitMode::Center => 4,
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FitMode::Fill => "Fill",
            FitMode::Fit => "Fit",
            FitMode::Stretch => "Stretch",
            FitMode::Tile => "Tile",
            FitMode::Center => "Center",
        };
        f.write_str(name)
    }
}

/// User settings, stored under the `AppSettings` key of the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub image_url: String,
    pub refresh_interval_minutes: u32,
    pub fit_mode: FitMode,
    pub enable_notifications: bool,
    pub local_image_path: Option<PathBuf>,
    #[serde(rename = "SourceType")]
    pub source_kind: SourceKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_url: String::new(),
            refresh_interval_minutes: DEFAULT_REFRESH_INTERVAL_MINUTES,
            fit_mode: FitMode::Fill,
            enable_notifications: true,
            local_image_path: None,
            source_kind: SourceKind::Url,
        }
    }
}

/// Durable runtime state shared between the producer and widget processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncState {
    pub is_enabled: bool,
    #[serde(rename = "LastKnownGoodImagePath")]
    pub last_known_good_path: Option<PathBuf>,
    pub is_first_run: bool,
    pub last_update_time: Option<DateTime<Local>>,
    #[serde(rename = "UpdateSuccessCount")]
    pub success_count: u64,
    #[serde(rename = "UpdateFailureCount")]
    pub failure_count: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            is_enabled: true,
            last_known_good_path: None,
            is_first_run: true,
            last_update_time: None,
            success_count: 0,
            failure_count: 0,
        }
    }
}

impl SyncState {
    /// The last-known-good artifact, but only while its file still exists.
    #[must_use]
    pub fn usable_last_known_good(&self) -> Option<&Path> {
        self.last_known_good_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty() && path.is_file())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WidgetSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl WidgetSize {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WidgetSize::Small => "small",
            WidgetSize::Medium => "medium",
            WidgetSize::Large => "large",
        }
    }
}

impl fmt::Display for WidgetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_signatures() {
        assert_eq!(
            classify_image(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00]),
            ImageFormat::Png
        );
        assert_eq!(classify_image(&[0xFF, 0xD8, 0xFF, 0xE0]), ImageFormat::Jpeg);
        assert_eq!(classify_image(&[0x42, 0x4D, 0x00]), ImageFormat::Bmp);
        assert_eq!(classify_image(&[0x42, 0x4D]), ImageFormat::Bmp);
    }

    #[test]
    fn rejects_short_and_foreign_content() {
        assert_eq!(classify_image(&[]), ImageFormat::Unknown);
        assert_eq!(classify_image(&[0x89]), ImageFormat::Unknown);
        assert_eq!(classify_image(&[0x4D, 0x5A, 0x90, 0x00]), ImageFormat::Unknown);
        assert_eq!(classify_image(b"<html></html>"), ImageFormat::Unknown);
        // Truncated PNG signature falls through to the shorter checks.
        assert_eq!(classify_image(&[0x89, 0x50, 0x4E]), ImageFormat::Unknown);
        assert_eq!(classify_image(&[0xFF, 0xD8]), ImageFormat::Unknown);
    }

    #[test]
    fn classify_file_reads_only_header() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("photo.png");
        std::fs::write(&exe, [0x4D, 0x5A, 0x90, 0x00, 0x03]).unwrap();
        assert_eq!(classify_image_file(&exe).unwrap(), ImageFormat::Unknown);

        let jpeg = dir.path().join("photo.bin");
        std::fs::write(&jpeg, [0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x43]).unwrap();
        assert_eq!(classify_image_file(&jpeg).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn artifact_name_round_trips_to_the_millisecond() {
        let at = Local.with_ymd_and_hms(2026, 2, 23, 14, 30, 5).unwrap()
            + TimeDelta::milliseconds(7);
        let name = artifact_file_name(&at);
        assert_eq!(name, "wallpaper-20260223-143005-007.png");
        assert!(is_artifact_file_name(&name));
        assert_eq!(parse_artifact_timestamp(&name), Some(at));
        assert_eq!(parse_artifact_timestamp("wallpaper-garbage.png"), None);
        assert_eq!(parse_artifact_timestamp("photo.png"), None);
    }

    #[test]
    fn settings_enums_serialize_as_integers() {
        let json = serde_json::to_value(Settings {
            fit_mode: FitMode::Tile,
            source_kind: SourceKind::LocalFile,
            ..Settings::default()
        })
        .unwrap();
        assert_eq!(json["FitMode"], 3);
        assert_eq!(json["SourceType"], 1);

        let err = serde_json::from_str::<Settings>(r#"{"FitMode": 9}"#).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn state_defaults_fill_missing_fields() {
        let state: SyncState = serde_json::from_str(r#"{"UpdateSuccessCount": 4}"#).unwrap();
        assert!(state.is_enabled);
        assert!(state.is_first_run);
        assert_eq!(state.success_count, 4);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn widget_sizes_order_small_to_large() {
        let mut sizes = vec![WidgetSize::Large, WidgetSize::Small, WidgetSize::Medium];
        sizes.sort();
        assert_eq!(sizes, [WidgetSize::Small, WidgetSize::Medium, WidgetSize::Large]);
    }
}
