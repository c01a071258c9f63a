//! Member presence as observed in the room.

use common::types::{EndpointId, FullJid, Region};
use common::role::Role;
use serde::{Deserialize, Serialize};

/// Presence status a member publishes while moving to a breakout room.
/// A departure carrying this status does not count as a normal leave.
pub const BREAKOUT_SWITCH_STATUS: &str = "switch_room";

/// Snapshot of one member's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPresence {
    /// Room-local nickname; doubles as the endpoint identifier.
    pub nickname: EndpointId,
    /// Full occupant address.
    pub jid: FullJid,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_id: Option<String>,
    #[serde(default)]
    pub region: Region,
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub video_muted: bool,
    #[serde(default)]
    pub desktop_muted: bool,
    /// Entity-capabilities hash; drives feature discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps_hash: Option<String>,
    #[serde(default)]
    pub is_recorder: bool,
    #[serde(default)]
    pub is_transcriber: bool,
    #[serde(default)]
    pub is_sip_gateway: bool,
    /// Free-form status; `switch_room` marks a breakout transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl MemberPresence {
    /// A minimal presence for the given occupant.
    #[must_use]
    pub fn new(jid: FullJid, role: Role) -> Self {
        let nickname = EndpointId::new(jid.resource());
        Self {
            nickname,
            jid,
            role,
            stats_id: None,
            region: Region::default(),
            audio_muted: false,
            video_muted: false,
            desktop_muted: false,
            caps_hash: None,
            is_recorder: false,
            is_transcriber: false,
            is_sip_gateway: false,
            status: None,
        }
    }

    /// Whether this member is a server-side component (recorder,
    /// transcriber or SIP gateway) rather than a user.
    #[must_use]
    pub fn is_component(&self) -> bool {
        self.is_recorder || self.is_transcriber || self.is_sip_gateway
    }

    /// Whether the member is leaving toward a breakout room.
    #[must_use]
    pub fn is_switching_to_breakout(&self) -> bool {
        self.status.as_deref() == Some(BREAKOUT_SWITCH_STATUS)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn occupant(nick: &str) -> FullJid {
        FullJid::parse(&format!("room@muc.example.com/{nick}")).unwrap()
    }

    #[test]
    fn test_nickname_derived_from_resource() {
        let presence = MemberPresence::new(occupant("alice"), Role::Member);
        assert_eq!(presence.nickname.as_str(), "alice");
    }

    #[test]
    fn test_breakout_switch_detection() {
        let mut presence = MemberPresence::new(occupant("bob"), Role::Member);
        assert!(!presence.is_switching_to_breakout());
        presence.status = Some(BREAKOUT_SWITCH_STATUS.to_string());
        assert!(presence.is_switching_to_breakout());
    }

    #[test]
    fn test_component_flags() {
        let mut presence = MemberPresence::new(occupant("jibri"), Role::Member);
        assert!(!presence.is_component());
        presence.is_recorder = true;
        assert!(presence.is_component());
    }
}
