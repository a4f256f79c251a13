//! Synced settings model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Keys of settings that synchronize across a user's devices.
///
/// The wire identifier is the snake_case key name; record ids that do not
/// map to a known key are ignored, so newer clients can add keys without
/// breaking older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    /// Color theme shared across devices
    Theme,
    /// Layout of the new-tab page
    NewTabLayout,
    /// Whether search suggestions are enabled
    SearchSuggestions,
}

impl SettingKey {
    /// All known setting keys
    pub const ALL: [Self; 3] = [Self::Theme, Self::NewTabLayout, Self::SearchSuggestions];

    /// Stable wire/storage identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Theme => "theme",
            Self::NewTabLayout => "new_tab_layout",
            Self::SearchSuggestions => "search_suggestions",
        }
    }

    /// Map a record id back to a known key
    #[must_use]
    pub fn from_record_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == id)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synced setting; `value == None` is the soft-deleted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub key: SettingKey,
    pub value: Option<String>,
}

/// Decrypted wire payload of a setting record.
///
/// Deletions travel as tombstone records, never as a null value, so the
/// payload value is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingPayload {
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_roundtrip() {
        for key in SettingKey::ALL {
            assert_eq!(SettingKey::from_record_id(key.as_str()), Some(key));
        }
    }

    #[test]
    fn test_unknown_record_id_maps_to_none() {
        assert_eq!(SettingKey::from_record_id("quantum_mode"), None);
    }

    #[test]
    fn test_display_matches_wire_id() {
        assert_eq!(SettingKey::NewTabLayout.to_string(), "new_tab_layout");
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = SettingPayload {
            value: "dark".to_string(),
        };
        let json = serde_json::to_vec(&payload).unwrap();
        let parsed: SettingPayload = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, payload);
    }
}
