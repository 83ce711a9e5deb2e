//! Locally persisted presets.
//!
//! Preferences are stored as one JSON object of keyed blobs. Every blob is
//! optional: a missing key, a corrupt blob, or a corrupt file all yield the
//! default value instead of an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use viralize_common::ViralizeResult;

use crate::composition::Identity;

/// Key of the reel header profile.
pub const REEL_PROFILE_KEY: &str = "viralize-reels-profile";

/// Key of the tweet card profile.
pub const TWEET_PROFILE_KEY: &str = "viralize-twitter-profile";

/// Key of the quote card field values.
pub const QUOTE_STATE_KEY: &str = "viralize-quote-state";

/// Reel header profile: who the rendered header claims to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReelProfile {
    pub name: String,
    pub username: String,
    /// Avatar image path.
    pub logo: Option<String>,
}

impl Default for ReelProfile {
    fn default() -> Self {
        let identity = Identity::default();
        Self {
            name: identity.display_name,
            username: identity.handle,
            logo: None,
        }
    }
}

impl ReelProfile {
    pub fn to_identity(&self) -> Identity {
        Identity {
            display_name: self.name.clone(),
            handle: self.username.clone(),
            avatar: self.logo.as_ref().map(PathBuf::from),
            verified: true,
        }
    }

    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            name: identity.display_name.clone(),
            username: identity.handle.clone(),
            logo: identity
                .avatar
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Tweet card profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TweetProfile {
    pub avatar: Option<String>,
    pub name: String,
    pub username: String,
    pub is_verified: bool,
}

/// Horizontal text alignment on the quote card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlignment {
    Left,
    #[default]
    Center,
    Right,
}

/// Quote card field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuoteState {
    pub text: String,
    pub author: String,
    pub bg_image: Option<String>,
    /// Background overlay opacity in percent.
    pub overlay_opacity: u8,
    pub highlight_color: String,
    pub alignment: TextAlignment,
    pub font_size: u32,
    pub username_size: u32,
    /// Card aspect ratio as `"w/h"`.
    pub aspect_ratio: String,
}

impl Default for QuoteState {
    fn default() -> Self {
        Self {
            text: String::new(),
            author: String::new(),
            bg_image: None,
            overlay_opacity: 60,
            highlight_color: "#38bdf8".to_string(),
            alignment: TextAlignment::Center,
            font_size: 30,
            username_size: 15,
            aspect_ratio: "9/16".to_string(),
        }
    }
}

/// File-backed store of keyed preference blobs.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: PathBuf,
    entries: BTreeMap<String, serde_json::Value>,
}

impl PreferenceStore {
    /// Open the store at `path`. An absent or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt preferences file");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the blob under `key`, or the default if absent or malformed.
    pub fn get<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.entries.get(key) {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(key, error = %e, "Ignoring malformed preference entry");
                    T::default()
                }
            },
            None => T::default(),
        }
    }

    /// Store `value` under `key` and write the file.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> ViralizeResult<()> {
        self.entries
            .insert(key.to_string(), serde_json::to_value(value)?);
        self.flush()
    }

    /// Remove the blob under `key` and write the file.
    pub fn remove(&mut self, key: &str) -> ViralizeResult<()> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn reel_profile(&self) -> ReelProfile {
        self.get(REEL_PROFILE_KEY)
    }

    pub fn save_reel_profile(&mut self, profile: &ReelProfile) -> ViralizeResult<()> {
        self.set(REEL_PROFILE_KEY, profile)
    }

    pub fn tweet_profile(&self) -> TweetProfile {
        self.get(TWEET_PROFILE_KEY)
    }

    pub fn save_tweet_profile(&mut self, profile: &TweetProfile) -> ViralizeResult<()> {
        self.set(TWEET_PROFILE_KEY, profile)
    }

    pub fn quote_state(&self) -> QuoteState {
        self.get(QUOTE_STATE_KEY)
    }

    pub fn save_quote_state(&mut self, state: &QuoteState) -> ViralizeResult<()> {
        self.set(QUOTE_STATE_KEY, state)
    }

    fn flush(&self) -> ViralizeResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::open(dir.path().join("prefs.json"));
        assert_eq!(store.reel_profile(), ReelProfile::default());
        assert_eq!(store.quote_state().overlay_opacity, 60);
    }

    #[test]
    fn test_profile_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let mut store = PreferenceStore::open(&path);
        let profile = ReelProfile {
            name: "Ana".to_string(),
            username: "@ana".to_string(),
            logo: Some("/tmp/ana.png".to_string()),
        };
        store.save_reel_profile(&profile).unwrap();

        let reopened = PreferenceStore::open(&path);
        assert_eq!(reopened.reel_profile(), profile);
        let identity = reopened.reel_profile().to_identity();
        assert_eq!(identity.handle_label(), "@ana");
        assert_eq!(identity.avatar, Some(PathBuf::from("/tmp/ana.png")));
    }

    #[test]
    fn test_partial_blob_keeps_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(
            &path,
            r#"{"viralize-quote-state": {"text": "hi", "alignment": "left"}}"#,
        )
        .unwrap();

        let store = PreferenceStore::open(&path);
        let quote = store.quote_state();
        assert_eq!(quote.text, "hi");
        assert_eq!(quote.alignment, TextAlignment::Left);
        assert_eq!(quote.highlight_color, "#38bdf8");
    }

    #[test]
    fn test_corrupt_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, r#"{"viralize-twitter-profile": 42}"#).unwrap();
        let store = PreferenceStore::open(&path);
        assert_eq!(store.tweet_profile(), TweetProfile::default());

        std::fs::write(&path, "not json at all").unwrap();
        let store = PreferenceStore::open(&path);
        assert_eq!(store.reel_profile(), ReelProfile::default());
    }

    #[test]
    fn test_tweet_profile_uses_camel_case_keys() {
        let profile = TweetProfile {
            avatar: None,
            name: "N".to_string(),
            username: "u".to_string(),
            is_verified: true,
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["isVerified"], serde_json::Value::Bool(true));
    }
}
