//! Mute and AV-moderation policy, end to end.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::features::{Feature, FeatureSet};
use common::media::MediaKind;
use common::role::Role;
use common::types::EndpointId;
use conference_focus::conference::messages::MuteResult;
use conference_focus::xmpp::room::RoomEvent;
use focus_test_utils::fixtures::{presence, room_jid};
use focus_test_utils::TestEnv;
use std::time::Duration;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

fn ep(name: &str) -> EndpointId {
    EndpointId::new(name)
}

async fn conference_with_roles(
    env: &TestEnv,
    room: &str,
    members: &[(&str, Role)],
) -> conference_focus::ConferenceHandle {
    let registry = env.registry();
    let handle = registry.conference_request(env.options(room)).await.unwrap();
    let mock_room = env.transport.room(&room_jid(room)).unwrap();
    for (nick, role) in members {
        mock_room
            .member_joins(presence(&room_jid(room), nick, *role))
            .await;
    }
    settle().await;
    handle
}

#[tokio::test]
async fn test_moderator_can_mute_others() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("carol", Role::Moderator), ("alice", Role::Member)],
    )
    .await;

    let result = handle
        .mute_request(ep("carol"), ep("alice"), MediaKind::Audio, true)
        .await;
    assert_eq!(result, MuteResult::Success);

    // enforced at the bridge and signaled to the peer
    let mutes = env
        .provisioner
        .calls()
        .into_iter()
        .filter(|c| {
            matches!(c, focus_test_utils::ProvisionCall::ForceMute { endpoints, muted: true, .. }
                if endpoints.contains(&ep("alice")))
        })
        .count();
    assert_eq!(mutes, 1);
    assert_eq!(
        env.signaling.mutes_to("alice"),
        vec![(MediaKind::Audio, true)]
    );
}

#[tokio::test]
async fn test_non_moderator_cannot_mute_others() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("alice", Role::Member), ("bob", Role::Member)],
    )
    .await;

    let result = handle
        .mute_request(ep("alice"), ep("bob"), MediaKind::Audio, true)
        .await;
    assert_eq!(result, MuteResult::NotAllowed);
    assert!(env.signaling.mutes_to("bob").is_empty());
}

#[tokio::test]
async fn test_muter_role_falls_back_to_room_lookup() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("alice", Role::Member), ("bob", Role::Member)],
    )
    .await;
    let room = env.transport.room(&room_jid("beta")).unwrap();

    // carol is in the room, but her presence event has not reached the
    // coordinator yet; her role comes from the room lookup
    room.seed_member(presence(&room_jid("beta"), "carol", Role::Moderator));

    let result = handle
        .mute_request(ep("carol"), ep("alice"), MediaKind::Audio, true)
        .await;
    assert_eq!(result, MuteResult::Success);
}

#[tokio::test]
async fn test_self_mute_always_allowed() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("alice", Role::Member), ("bob", Role::Member)],
    )
    .await;

    let result = handle
        .mute_request(ep("alice"), ep("alice"), MediaKind::Audio, true)
        .await;
    assert_eq!(result, MuteResult::Success);
}

#[tokio::test]
async fn test_self_unmute_requires_whitelist() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("alice", Role::Member), ("bob", Role::Member)],
    )
    .await;

    let room = env.transport.room(&room_jid("beta")).unwrap();
    room.set_unmute_whitelist(MediaKind::Audio, &["bob"]);

    let denied = handle
        .mute_request(ep("alice"), ep("alice"), MediaKind::Audio, false)
        .await;
    assert_eq!(denied, MuteResult::NotAllowed);

    let allowed = handle
        .mute_request(ep("bob"), ep("bob"), MediaKind::Audio, false)
        .await;
    assert_eq!(allowed, MuteResult::Success);
}

#[tokio::test]
async fn test_moderator_unmutes_self_without_whitelist() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("carol", Role::Moderator), ("alice", Role::Member)],
    )
    .await;

    let room = env.transport.room(&room_jid("beta")).unwrap();
    room.set_unmute_whitelist(MediaKind::Audio, &[]);

    let result = handle
        .mute_request(ep("carol"), ep("carol"), MediaKind::Audio, false)
        .await;
    assert_eq!(result, MuteResult::Success);
}

#[tokio::test]
async fn test_trusted_component_without_unmute_is_exempt() {
    let env = TestEnv::new();
    let registry = env.registry();
    let handle = registry.conference_request(env.options("beta")).await.unwrap();
    let room = env.transport.room(&room_jid("beta")).unwrap();

    room.member_joins(presence(&room_jid("beta"), "carol", Role::Moderator)).await;
    let mut recorder = presence(&room_jid("beta"), "jibri", Role::Member);
    recorder.is_recorder = true;
    // the recorder cannot unmute itself: no audio-mute feature
    env.transport.set_features(
        recorder.jid.clone(),
        FeatureSet::new([Feature::Audio, Feature::Video]),
    );
    room.member_joins(recorder).await;
    settle().await;

    let result = handle
        .mute_request(ep("carol"), ep("jibri"), MediaKind::Audio, true)
        .await;
    assert_eq!(result, MuteResult::NotAllowed);
}

#[tokio::test]
async fn test_mute_all_by_moderator() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[
            ("carol", Role::Moderator),
            ("alice", Role::Member),
            ("bob", Role::Member),
        ],
    )
    .await;

    let result = handle.mute_all(MediaKind::Audio, ep("carol")).await;
    assert_eq!(result, MuteResult::Success);

    // members are muted, the moderator actor is not
    assert_eq!(env.signaling.mutes_to("alice"), vec![(MediaKind::Audio, true)]);
    assert_eq!(env.signaling.mutes_to("bob"), vec![(MediaKind::Audio, true)]);
    assert!(env.signaling.mutes_to("carol").is_empty());
}

#[tokio::test]
async fn test_mute_all_by_member_denied() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("alice", Role::Member), ("bob", Role::Member)],
    )
    .await;

    let result = handle.mute_all(MediaKind::Audio, ep("alice")).await;
    assert_eq!(result, MuteResult::NotAllowed);
    assert!(env.signaling.mutes_to("bob").is_empty());
}

#[tokio::test]
async fn test_av_moderation_start_mutes_new_invites() {
    let env = TestEnv::new();
    let registry = env.registry();
    let _handle = registry.conference_request(env.options("beta")).await.unwrap();
    let room = env.transport.room(&room_jid("beta")).unwrap();

    room.inject(RoomEvent::AvModerationChanged {
        kind: MediaKind::Audio,
        enabled: true,
    })
    .await;
    settle().await;

    room.member_joins(presence(&room_jid("beta"), "alice", Role::Member)).await;
    room.member_joins(presence(&room_jid("beta"), "carol", Role::Moderator)).await;
    settle().await;

    let alice_offer = env.signaling.initiates_to("alice").pop().unwrap();
    assert!(alice_offer.start_muted.audio);
    assert!(!alice_offer.start_muted.video);

    // moderators are never force-muted
    let carol_offer = env.signaling.initiates_to("carol").pop().unwrap();
    assert!(!carol_offer.start_muted.audio);
}

#[tokio::test]
async fn test_room_start_muted_applies_to_invites() {
    let env = TestEnv::new();
    let registry = env.registry();
    let _handle = registry.conference_request(env.options("beta")).await.unwrap();
    let room = env.transport.room(&room_jid("beta")).unwrap();

    room.inject(RoomEvent::StartMutedChanged {
        audio: true,
        video: true,
    })
    .await;
    settle().await;

    room.member_joins(presence(&room_jid("beta"), "alice", Role::Member)).await;
    room.member_joins(presence(&room_jid("beta"), "bob", Role::Member)).await;
    settle().await;

    let offer = env.signaling.initiates_to("alice").pop().unwrap();
    assert!(offer.start_muted.audio);
    assert!(offer.start_muted.video);
}

#[tokio::test]
async fn test_desktop_mute_tracks_state_separately() {
    let env = TestEnv::new();
    let handle = conference_with_roles(
        &env,
        "beta",
        &[("carol", Role::Moderator), ("alice", Role::Member)],
    )
    .await;

    let result = handle
        .mute_request(ep("carol"), ep("alice"), MediaKind::Desktop, true)
        .await;
    assert_eq!(result, MuteResult::Success);

    // the bridge sees a video mute, the peer a desktop directive
    let bridge_mutes = env
        .provisioner
        .calls()
        .into_iter()
        .filter(|c| {
            matches!(c, focus_test_utils::ProvisionCall::ForceMute { kind: MediaKind::Video, .. })
        })
        .count();
    assert_eq!(bridge_mutes, 1);
    assert_eq!(
        env.signaling.mutes_to("alice"),
        vec![(MediaKind::Desktop, true)]
    );
}
