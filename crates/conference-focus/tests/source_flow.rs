//! Source validation, propagation, sender limits and session lifecycle
//! around sources.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::media::{EndpointSources, MediaKind, Source};
use common::role::Role;
use common::types::EndpointId;
use conference_focus::FocusError;
use focus_test_utils::fixtures::{init_tracing, presence, room_jid};
use focus_test_utils::TestEnv;
use std::time::Duration;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

fn audio(ssrcs: &[u32]) -> EndpointSources {
    EndpointSources::from_sources(
        ssrcs.iter().map(|s| Source::new(*s, MediaKind::Audio)).collect(),
    )
}

fn ep(name: &str) -> EndpointId {
    EndpointId::new(name)
}

/// Spin up a conference with the given members already invited.
async fn conference_with(
    env: &TestEnv,
    room: &str,
    members: &[&str],
) -> conference_focus::ConferenceHandle {
    init_tracing();
    let registry = env.registry();
    let handle = registry.conference_request(env.options(room)).await.unwrap();
    let mock_room = env.transport.room(&room_jid(room)).unwrap();
    for nick in members {
        mock_room
            .member_joins(presence(&room_jid(room), nick, Role::Member))
            .await;
    }
    settle().await;
    handle
}

#[tokio::test]
async fn test_sender_cap_rejects_third_audio_sender() {
    let mut env = TestEnv::new();
    env.config.max_audio_senders = Some(2);
    let handle = conference_with(&env, "cap", &["a", "b", "c"]).await;

    handle.add_source(ep("a"), audio(&[1])).await.unwrap();
    handle.add_source(ep("b"), audio(&[2])).await.unwrap();

    let err = handle.add_source(ep("c"), audio(&[3])).await.unwrap_err();
    assert!(matches!(
        err,
        FocusError::SenderLimitExceeded(MediaKind::Audio)
    ));

    // the property flipped once the limit was met
    let room = env.transport.room(&room_jid("cap")).unwrap();
    assert_eq!(room.property("audio-limit-reached").as_deref(), Some("true"));

    // an existing audio sender may still add more audio sources
    assert!(handle.add_source(ep("a"), audio(&[4])).await.is_ok());
}

#[tokio::test]
async fn test_room_observed_sender_counts_feed_the_cap() {
    let mut env = TestEnv::new();
    env.config.max_audio_senders = Some(2);
    env.config.max_video_senders = Some(1);
    let handle = conference_with(&env, "cap", &["a", "b"]).await;
    let room = env.transport.room(&room_jid("cap")).unwrap();

    // presence already shows one open mic and one camera
    room.set_sender_counts(1, 1);

    // a's first audio source passes (one mic observed, limit two), and
    // the refresh sees the room's camera against the video cap
    handle.add_source(ep("a"), audio(&[1])).await.unwrap();
    assert_eq!(room.property("audio-limit-reached").as_deref(), Some("false"));
    assert_eq!(room.property("video-limit-reached").as_deref(), Some("true"));

    // the room now observes two open mics: a new audio sender direction
    // is rejected even though the registry only knows one
    room.set_sender_counts(2, 1);
    let err = handle.add_source(ep("b"), audio(&[2])).await.unwrap_err();
    assert!(matches!(
        err,
        FocusError::SenderLimitExceeded(MediaKind::Audio)
    ));
}

#[tokio::test]
async fn test_ssrc_conflict_rejected_and_state_unchanged() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "conflict", &["a", "b"]).await;

    handle.add_source(ep("a"), audio(&[111])).await.unwrap();

    let err = handle.add_source(ep("b"), audio(&[111])).await.unwrap_err();
    assert!(matches!(err, FocusError::ValidationFailed(_)));

    // a still owns 111: a re-add by the owner is an idempotent no-op
    let accepted = handle.add_source(ep("a"), audio(&[111])).await.unwrap();
    assert!(accepted.is_empty());
    // and b holds nothing: removing 111 as b still fails validation
    assert!(handle.remove_source(ep("b"), audio(&[111])).await.is_err());
}

#[tokio::test]
async fn test_sources_propagate_to_accepted_peers() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;

    handle
        .accept_session(ep("bob"), EndpointSources::default(), None, None)
        .await
        .unwrap();

    handle.add_source(ep("alice"), audio(&[10, 11])).await.unwrap();
    settle().await;

    let adds = env.signaling.source_adds_to("bob");
    assert_eq!(adds.len(), 1);
    assert_eq!(
        adds.first().unwrap().get(&ep("alice")).unwrap().ssrc_list(),
        vec![10, 11]
    );
    // the owner does not hear its own sources back
    assert!(env.signaling.source_adds_to("alice").is_empty());
}

#[tokio::test]
async fn test_queued_sources_flush_on_accept() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;

    // bob has not accepted yet: the delta is stored, not signaled
    handle.add_source(ep("alice"), audio(&[10])).await.unwrap();
    settle().await;
    assert!(env.signaling.source_adds_to("bob").is_empty());

    handle
        .accept_session(ep("bob"), EndpointSources::default(), None, None)
        .await
        .unwrap();
    settle().await;

    let adds = env.signaling.source_adds_to("bob");
    assert_eq!(adds.len(), 1);
    assert_eq!(
        adds.first().unwrap().get(&ep("alice")).unwrap().ssrc_list(),
        vec![10]
    );
}

#[tokio::test(start_paused = true)]
async fn test_coalesced_flush_emits_remove_before_add() {
    let mut env = TestEnv::new();
    // force a coalescing window so both deltas land in one flush
    env.config.source_signaling_low = 0;
    env.config.source_signaling_slope = Duration::from_millis(100);
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;

    handle
        .accept_session(ep("bob"), EndpointSources::default(), None, None)
        .await
        .unwrap();
    handle.add_source(ep("alice"), audio(&[1])).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(env.signaling.source_adds_to("bob").len(), 1);

    handle.remove_source(ep("alice"), audio(&[1])).await.unwrap();
    handle.add_source(ep("alice"), audio(&[2])).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;

    let order = env.signaling.signal_order_to("bob");
    let tail: Vec<&str> = order
        .iter()
        .filter(|k| k.starts_with("source-"))
        .copied()
        .collect();
    assert_eq!(tail, vec!["source-add", "source-remove", "source-add"]);
}

#[tokio::test]
async fn test_participant_departure_removes_and_propagates_sources() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;

    handle
        .accept_session(ep("bob"), EndpointSources::default(), None, None)
        .await
        .unwrap();
    handle.add_source(ep("alice"), audio(&[7])).await.unwrap();
    settle().await;

    let room = env.transport.room(&room_jid("beta")).unwrap();
    room.member_leaves("alice", None).await;
    settle().await;

    let removes = env.signaling.source_removes_to("bob");
    assert_eq!(removes.len(), 1);
    assert_eq!(
        removes.first().unwrap().get(&ep("alice")).unwrap().ssrc_list(),
        vec![7]
    );
}

#[tokio::test]
async fn test_accept_session_updates_bridge() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;

    handle
        .accept_session(ep("alice"), audio(&[5]), None, Some(10))
        .await
        .unwrap();

    let updates: Vec<_> = env
        .provisioner
        .calls()
        .into_iter()
        .filter(|c| matches!(c, focus_test_utils::ProvisionCall::Update { endpoint, .. } if *endpoint == ep("alice")))
        .collect();
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn test_accept_without_session_is_rejected() {
    let env = TestEnv::new();
    // a single member is never invited, so no session exists
    let handle = conference_with(&env, "beta", &["alice"]).await;
    let err = handle
        .accept_session(ep("alice"), EndpointSources::default(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FocusError::InvalidBridgeSession | FocusError::ParticipantNotFound(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_session_restart_rate_limited() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;
    let sid = env.provisioner.session_id_for(&room_jid("beta")).unwrap();

    // first restart is accepted and re-invites with a fresh initiate
    handle
        .terminate_session(ep("alice"), sid.clone(), true)
        .await
        .unwrap();
    settle().await;
    assert_eq!(env.signaling.initiates_to("alice").len(), 2);

    // a second within ten seconds is rejected
    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    let err = handle
        .terminate_session(ep("alice"), sid.clone(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, FocusError::NotAllowed(_)));

    // spaced requests pass until the per-minute budget is spent
    tokio::time::advance(Duration::from_secs(11)).await;
    handle
        .terminate_session(ep("alice"), sid.clone(), true)
        .await
        .unwrap();
    settle().await;
    tokio::time::advance(Duration::from_secs(11)).await;
    handle
        .terminate_session(ep("alice"), sid.clone(), true)
        .await
        .unwrap();
    settle().await;
    tokio::time::advance(Duration::from_secs(11)).await;
    let err = handle
        .terminate_session(ep("alice"), sid, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FocusError::NotAllowed(_)));
}

#[tokio::test]
async fn test_terminate_with_wrong_session_id_rejected() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;

    let err = handle
        .terminate_session(ep("alice"), "bogus-session".to_string(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, FocusError::InvalidBridgeSession));
}

#[tokio::test]
async fn test_ice_failed_with_matching_session_restarts() {
    let env = TestEnv::new();
    let handle = conference_with(&env, "beta", &["alice", "bob"]).await;
    let sid = env.provisioner.session_id_for(&room_jid("beta")).unwrap();

    // a mismatching id is ignored
    handle.ice_failed(ep("alice"), "stale".to_string()).await;
    settle().await;
    assert_eq!(env.signaling.initiates_to("alice").len(), 1);

    handle.ice_failed(ep("alice"), sid).await;
    settle().await;
    assert_eq!(env.signaling.initiates_to("alice").len(), 2);
}
