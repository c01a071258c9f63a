//! Visitor-node overflow: redirect policy, mirror-room joins and visitor
//! invitations.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::role::Role;
use focus_test_utils::fixtures::{presence, room_jid};
use focus_test_utils::TestEnv;
use std::time::Duration;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

fn mirror_jid(room: &str) -> common::types::RoomJid {
    common::types::RoomJid::parse(&format!("{room}@muc.v1.example.com")).unwrap()
}

async fn overflow_env() -> (TestEnv, conference_focus::ConferenceHandle) {
    let mut env = TestEnv::new();
    env.config.visitors_enabled = true;
    env.config.visitor_codecs = "vp9,opus".to_string();
    let registry = env.registry();
    let handle = registry.conference_request(env.options("weekly")).await.unwrap();

    let room = env.transport.room(&room_jid("weekly")).unwrap();
    room.set_participants_soft_limit(Some(2));
    room.member_joins(presence(&room_jid("weekly"), "alice", Role::Member)).await;
    room.member_joins(presence(&room_jid("weekly"), "bob", Role::Member)).await;
    settle().await;

    (env, handle)
}

#[tokio::test]
async fn test_redirect_at_soft_limit() {
    let (env, handle) = overflow_env().await;

    let node = handle.redirect_visitor(false).await;
    assert_eq!(node.as_deref(), Some("v1"));
    settle().await;

    // the mirror room was joined and the router was told to connect
    let mirror = env.transport.room(&mirror_jid("weekly")).unwrap();
    assert!(mirror.joined());
    assert_eq!(
        env.visitors.connects(),
        vec![("v1".to_string(), room_jid("weekly"))]
    );
}

#[tokio::test]
async fn test_no_redirect_below_limit() {
    let mut env = TestEnv::new();
    env.config.visitors_enabled = true;
    let registry = env.registry();
    let handle = registry.conference_request(env.options("weekly")).await.unwrap();

    let room = env.transport.room(&room_jid("weekly")).unwrap();
    room.set_participants_soft_limit(Some(50));
    room.member_joins(presence(&room_jid("weekly"), "alice", Role::Member)).await;
    settle().await;

    assert_eq!(handle.redirect_visitor(false).await, None);
}

#[tokio::test]
async fn test_explicit_visitor_request_redirects_below_limit() {
    let mut env = TestEnv::new();
    env.config.visitors_enabled = true;
    let registry = env.registry();
    let handle = registry.conference_request(env.options("weekly")).await.unwrap();
    let room = env.transport.room(&room_jid("weekly")).unwrap();
    room.set_participants_soft_limit(Some(50));

    assert_eq!(handle.redirect_visitor(true).await.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_no_redirect_when_disabled_or_lobby_or_breakout() {
    // disabled globally and not overridden by the room
    let env = TestEnv::new();
    let registry = env.registry();
    let handle = registry.conference_request(env.options("weekly")).await.unwrap();
    assert_eq!(handle.redirect_visitor(true).await, None);

    // lobby suppresses visitors
    let mut env = TestEnv::new();
    env.config.visitors_enabled = true;
    let registry = env.registry();
    let handle = registry.conference_request(env.options("guarded")).await.unwrap();
    env.transport
        .room(&room_jid("guarded"))
        .unwrap()
        .set_lobby_enabled(true);
    assert_eq!(handle.redirect_visitor(true).await, None);

    // breakout rooms never redirect
    let mut env = TestEnv::new();
    env.config.visitors_enabled = true;
    let registry = env.registry();
    registry.conference_request(env.options("main")).await.unwrap();
    let breakout = registry
        .conference_request(env.breakout_options("main-b1", "main"))
        .await
        .unwrap();
    assert_eq!(breakout.redirect_visitor(true).await, None);
}

#[tokio::test]
async fn test_room_override_enables_visitors() {
    // disabled in config, required by the room
    let env = TestEnv::new();
    let registry = env.registry();
    let handle = registry.conference_request(env.options("weekly")).await.unwrap();
    let room = env.transport.room(&room_jid("weekly")).unwrap();
    room.set_visitors_enabled(Some(true));

    assert_eq!(handle.redirect_visitor(true).await.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_visitor_join_invited_and_counted() {
    let (env, handle) = overflow_env().await;

    handle.redirect_visitor(false).await.unwrap();
    settle().await;

    // the visitor lands in the mirror room
    let mirror = env.transport.room(&mirror_jid("weekly")).unwrap();
    mirror
        .member_joins(presence(&mirror_jid("weekly"), "vic", Role::Visitor))
        .await;
    settle().await;

    // invited like any endpoint
    assert_eq!(env.signaling.initiates_to("vic").len(), 1);

    // and reflected in the conference properties
    let room = env.transport.room(&room_jid("weekly")).unwrap();
    assert_eq!(room.property("visitor-count").as_deref(), Some("1"));
    assert_eq!(room.property("visitor-codecs").as_deref(), Some("vp9,opus"));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.visitor_count, 1);
    let vic = snapshot
        .participants
        .iter()
        .find(|p| p.endpoint.as_str() == "vic")
        .unwrap();
    assert!(vic.visitor);
}

#[tokio::test]
async fn test_further_redirects_reuse_the_node() {
    let (env, handle) = overflow_env().await;

    handle.redirect_visitor(false).await.unwrap();
    settle().await;
    // once visitors are in use, later joiners keep being redirected
    assert_eq!(handle.redirect_visitor(false).await.as_deref(), Some("v1"));
    assert_eq!(handle.redirect_visitor(false).await.as_deref(), Some("v1"));
    settle().await;

    // the mirror room was joined and connected exactly once
    assert_eq!(env.visitors.connects().len(), 1);
}

#[tokio::test]
async fn test_visitor_departure_updates_count_and_cleans_up() {
    let (env, handle) = overflow_env().await;

    handle.redirect_visitor(false).await.unwrap();
    settle().await;
    let mirror = env.transport.room(&mirror_jid("weekly")).unwrap();
    mirror
        .member_joins(presence(&mirror_jid("weekly"), "vic", Role::Visitor))
        .await;
    settle().await;

    mirror.member_leaves("vic", None).await;
    settle().await;

    let room = env.transport.room(&room_jid("weekly")).unwrap();
    assert_eq!(room.property("visitor-count").as_deref(), Some("0"));
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.participants.iter().all(|p| p.endpoint.as_str() != "vic"));
}

#[tokio::test]
async fn test_stop_disconnects_visitor_nodes() {
    let (env, handle) = overflow_env().await;

    handle.redirect_visitor(false).await.unwrap();
    settle().await;

    handle.stop().await;
    settle().await;

    assert_eq!(
        env.visitors.disconnects(),
        vec![("v1".to_string(), room_jid("weekly"))]
    );
    let mirror = env.transport.room(&mirror_jid("weekly")).unwrap();
    assert!(mirror.left());
}
