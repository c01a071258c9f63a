//! Force-mute and AV-moderation policy.
//!
//! Pure decision functions; enforcement happens at the bridge and via the
//! mute directive toward the peer.

use crate::xmpp::jingle::MutedKinds;
use common::features::{Feature, FeatureSet};
use common::media::MediaKind;
use common::role::Role;

/// Whether the member may be force-muted at all: moderators are exempt,
/// and so are trusted components (recorder, SIP gateway) that could not
/// unmute themselves afterwards.
#[must_use]
pub fn may_force_mute(role: Role, trusted_component: bool, features: &FeatureSet) -> bool {
    if role.has_moderator_rights() {
        return false;
    }
    if trusted_component && !features.contains(Feature::AudioMute) {
        return false;
    }
    true
}

/// Compute the start-muted directive for a new invite. `policy` combines
/// the room's start-muted flags with the per-kind AV-moderation state.
#[must_use]
pub fn force_mute_on_invite(
    policy: MutedKinds,
    role: Role,
    trusted_component: bool,
    features: &FeatureSet,
) -> MutedKinds {
    if !may_force_mute(role, trusted_component, features) {
        return MutedKinds::default();
    }
    policy
}

/// Why a mute request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteDenied {
    /// Non-moderators may only mute themselves.
    NotSelf,
    /// Unmuting requires the room's per-kind whitelist.
    UnmuteNotWhitelisted,
    /// The target must stay unmuted (trusted component without unmute).
    TargetExempt,
}

/// Validate a mute request. `allowed_to_unmute` is the room's whitelist
/// answer for the target and kind, consulted only when needed.
pub fn check_mute_request(
    muter_role: Role,
    is_self: bool,
    mute: bool,
    target_trusted: bool,
    target_features: &FeatureSet,
    allowed_to_unmute: impl FnOnce() -> bool,
) -> Result<(), MuteDenied> {
    if !is_self && !muter_role.has_moderator_rights() {
        return Err(MuteDenied::NotSelf);
    }
    if mute && !is_self && target_trusted && !target_features.contains(Feature::AudioMute) {
        return Err(MuteDenied::TargetExempt);
    }
    if !mute && !muter_role.has_moderator_rights() && !allowed_to_unmute() {
        return Err(MuteDenied::UnmuteNotWhitelisted);
    }
    Ok(())
}

/// AV-moderation state per kind. Desktop shares the video flag at the
/// bridge but keeps its own unmute authorization in the room whitelist.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvModeration {
    pub audio: bool,
    pub video: bool,
}

impl AvModeration {
    pub fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind.bridge_kind() {
            MediaKind::Audio => self.audio = enabled,
            _ => self.video = enabled,
        }
    }

    /// Combine with the room's start-muted flags into the invite policy.
    #[must_use]
    pub fn combined_with(self, start_muted: MutedKinds) -> MutedKinds {
        MutedKinds {
            audio: self.audio || start_muted.audio,
            video: self.video || start_muted.video,
        }
    }
}
