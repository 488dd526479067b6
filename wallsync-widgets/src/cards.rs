use chrono::{DateTime, Local};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use wallsync_core::{Settings, SourceKind, SyncState, WidgetSize};

/// Shown instead of a `file://` path, which cards cannot load.
pub const LOCAL_FILE_PLACEHOLDER_URL: &str =
    "https://via.placeholder.com/400x225?text=Local+File+Mode";
pub const NEVER_UPDATED_TEXT: &str = "Never";
const LAST_UPDATED_FORMAT: &str = "%a %H:%M";

const SMALL_TEMPLATE: &str = include_str!("../assets/cards/small.json");
const MEDIUM_TEMPLATE: &str = include_str!("../assets/cards/medium.json");
const LARGE_TEMPLATE: &str = include_str!("../assets/cards/large.json");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CardError {
    #[error("card template has unresolved token ${{{0}}}")]
    UnresolvedToken(String),
    #[error("card template has an unterminated token at byte {0}")]
    Unterminated(usize),
}

/// What every card shows, computed once per fan-out pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetData {
    pub display_url: String,
    pub last_updated_text: String,
    pub status_text: String,
    pub has_image: bool,
}

impl WidgetData {
    #[must_use]
    pub fn new(settings: &Settings, state: &SyncState) -> Self {
        let (display_url, has_image) = match settings.source_kind {
            SourceKind::Url => (
                settings.image_url.clone(),
                !settings.image_url.trim().is_empty(),
            ),
            SourceKind::LocalFile => (
                LOCAL_FILE_PLACEHOLDER_URL.to_owned(),
                settings
                    .local_image_path
                    .as_ref()
                    .is_some_and(|path| !path.as_os_str().is_empty()),
            ),
        };
        Self {
            display_url,
            last_updated_text: last_updated_text(state.last_update_time.as_ref()),
            status_text: (if state.is_enabled { "Active" } else { "Paused" }).to_owned(),
            has_image,
        }
    }

    /// Hex SHA-256 of the display URL; lets a host skip redraws of identical images.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.display_url.as_bytes()))
    }

    fn token_value(&self, token: &str) -> Option<&str> {
        match token {
            "imageUrl" => Some(&self.display_url),
            "lastUpdated" => Some(&self.last_updated_text),
            "status" => Some(&self.status_text),
            _ => None,
        }
    }
}

#[must_use]
pub fn last_updated_text(at: Option<&DateTime<Local>>) -> String {
    match at {
        Some(at) => at.format(LAST_UPDATED_FORMAT).to_string(),
        None => NEVER_UPDATED_TEXT.to_owned(),
    }
}

/// One card template per widget size.
#[derive(Debug, Clone)]
pub struct CardTemplates {
    small: String,
    medium: String,
    large: String,
}

impl Default for CardTemplates {
    fn default() -> Self {
        Self::embedded()
    }
}

impl CardTemplates {
    /// The templates compiled into the binary.
    #[must_use]
    pub fn embedded() -> Self {
        Self::new(SMALL_TEMPLATE, MEDIUM_TEMPLATE, LARGE_TEMPLATE)
    }

    #[must_use]
    pub fn new(
        small: impl Into<String>,
        medium: impl Into<String>,
        large: impl Into<String>,
    ) -> Self {
        Self {
            small: small.into(),
            medium: medium.into(),
            large: large.into(),
        }
    }

    #[must_use]
    pub fn template(&self, size: WidgetSize) -> &str {
        match size {
            WidgetSize::Small => &self.small,
            WidgetSize::Medium => &self.medium,
            WidgetSize::Large => &self.large,
        }
    }

    pub fn render(&self, size: WidgetSize, data: &WidgetData) -> Result<String, CardError> {
        hydrate(self.template(size), data)
    }
}

/// Replaces every `${token}` in one pass. Values are inserted JSON-escaped, so a
/// template token must sit inside a string literal.
pub fn hydrate(template: &str, data: &WidgetData) -> Result<String, CardError> {
    let mut out = String::with_capacity(template.len() + 128);
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or(CardError::Unterminated(offset + start))?;
        let token = &after[..end];
        let value = data
            .token_value(token)
            .ok_or_else(|| CardError::UnresolvedToken(token.to_owned()))?;
        out.push_str(&json_escaped(value));

        let consumed = start + 2 + end + 1;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn json_escaped(value: &str) -> String {
    let quoted = Value::from(value).to_string();
    quoted
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_owned()
}
