//! Conference properties mirrored into the focus occupant's presence.

use serde_json::Value;
use std::collections::BTreeMap;

/// Presence extension name the property map is published under.
pub const PRESENCE_EXTENSION: &str = "conference-properties";

pub const AUDIO_LIMIT_REACHED: &str = "audio-limit-reached";
pub const VIDEO_LIMIT_REACHED: &str = "video-limit-reached";
pub const VISITOR_COUNT: &str = "visitor-count";
pub const VISITOR_CODECS: &str = "visitor-codecs";
pub const VISITORS_ENABLED: &str = "visitors-enabled";
pub const BRIDGE_COUNT: &str = "bridge-count";
pub const SUPPORTS_SESSION_RESTART: &str = "supports-session-restart";
pub const AUDIO_RECORDING_ENABLED: &str = "audio-recording-enabled";
pub const BRIDGE_SELECTION_FAILED: &str = "bridge-selection-failed";

/// The string→string property map broadcast via presence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConferenceProperties {
    map: BTreeMap<String, String>,
}

impl ConferenceProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property; returns true when the broadcast value changed.
    pub fn set(&mut self, key: &str, value: impl ToString) -> bool {
        let value = value.to_string();
        match self.map.get(key) {
            Some(existing) if *existing == value => false,
            _ => {
                self.map.insert(key.to_string(), value);
                true
            }
        }
    }

    /// Drop a property; returns true when it was present.
    pub fn unset(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// The presence payload.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.map).unwrap_or(Value::Null)
    }

    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.map
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_change() {
        let mut props = ConferenceProperties::new();
        assert!(props.set(BRIDGE_COUNT, 1));
        assert!(!props.set(BRIDGE_COUNT, 1));
        assert!(props.set(BRIDGE_COUNT, 2));
        assert_eq!(props.get(BRIDGE_COUNT), Some("2"));
    }

    #[test]
    fn test_unset() {
        let mut props = ConferenceProperties::new();
        props.set(AUDIO_LIMIT_REACHED, true);
        assert!(props.unset(AUDIO_LIMIT_REACHED));
        assert!(!props.unset(AUDIO_LIMIT_REACHED));
    }

    #[test]
    fn test_json_payload() {
        let mut props = ConferenceProperties::new();
        props.set(SUPPORTS_SESSION_RESTART, true);
        let json = props.to_json();
        assert_eq!(json[SUPPORTS_SESSION_RESTART], "true");
    }
}
