use serde_json::Value;
use tracing::warn;

use crate::entry::ConversationEntry;

/// Value older pipeline versions stored in place of a real photo URL.
pub const PLACEHOLDER_SENTINEL: &str = "placeholder_image_url";

/// Resolves stored photo references into displayable absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoResolver {
    base_url: Option<String>,
    sentinels: Vec<String>,
}

impl Default for PhotoResolver {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PhotoResolver {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        Self {
            base_url,
            sentinels: vec![PLACEHOLDER_SENTINEL.to_string()],
        }
    }

    pub fn with_sentinels<I, S>(mut self, sentinels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sentinels = sentinels
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
        self
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Normalize a raw photo reference.
    ///
    /// Absolute http(s) URLs pass through unchanged. Empty values and
    /// sentinels resolve to `None`, as do relative paths when no base URL is
    /// configured.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || self.sentinels.iter().any(|s| s == raw) {
            return None;
        }

        if is_absolute(raw) {
            return Some(raw.to_string());
        }

        let Some(base) = self.base_url.as_deref() else {
            warn!(path = raw, "no API base URL configured, dropping relative photo path");
            return None;
        };

        let url = match (base.ends_with('/'), raw.starts_with('/')) {
            (true, true) => format!("{}{}", base, &raw[1..]),
            (false, false) => format!("{}/{}", base, raw),
            _ => format!("{}{}", base, raw),
        };
        Some(url)
    }

    /// The normalized photo of an entry, if it has one.
    ///
    /// `photo_url` is canonical. When it is missing, blank or a sentinel the
    /// legacy keys are tried instead.
    pub fn entry_photo(&self, entry: &ConversationEntry) -> Option<String> {
        if let Some(url) = entry.photo_url.as_deref().and_then(|raw| self.normalize(raw)) {
            return Some(url);
        }
        legacy_photos(entry).find_map(|raw| self.normalize(raw))
    }
}

fn is_absolute(url: &str) -> bool {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Photo references stored under non-canonical keys.
///
/// Records written before `photo_url` was settled may use `photoUrl`, `photo`
/// or similar, so any other string-valued key containing "photo" counts. Each
/// one read is logged.
pub fn legacy_photos(entry: &ConversationEntry) -> impl Iterator<Item = &str> {
    entry.extra.iter().filter_map(|(key, value)| {
        if !key.to_ascii_lowercase().contains("photo") {
            return None;
        }
        let Value::String(url) = value else {
            return None;
        };
        warn!(field = %key, "photo read from non-canonical field, expected photo_url");
        Some(url.as_str())
    })
}
