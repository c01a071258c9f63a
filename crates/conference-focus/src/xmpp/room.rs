//! The chat-room collaborator: room handles and the room event stream.
//!
//! The transport delivers room and connection events on a per-room channel;
//! the conference coordinator consumes that channel in its actor loop, so
//! no transport callback ever executes conference logic on the signaling
//! thread.

use super::presence::MemberPresence;
use async_trait::async_trait;
use common::features::FeatureSet;
use common::media::MediaKind;
use common::role::Role;
use common::types::{FullJid, MeetingId, RoomJid};
use thiserror::Error;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("room join failed: {0}")]
    Join(String),

    #[error("request timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Other(String),
}

/// Events delivered on a room's event channel.
///
/// Connection-level events (`SignalingLost`, `SignalingRestored`) are
/// fanned out to every room channel so a conference observes its own copy.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    MemberJoined(MemberPresence),
    /// `presence` is the last presence seen for the member, carrying the
    /// status used to detect a breakout transition.
    MemberLeft { presence: MemberPresence },
    MemberKicked { presence: MemberPresence },
    RoomDestroyed { reason: Option<String> },
    /// The focus occupant's own role changed.
    LocalRoleChanged(Role),
    /// The room assigned (or changed) the meeting identifier.
    MeetingIdSet(MeetingId),
    AudioSendersChanged(usize),
    VideoSendersChanged(usize),
    StartMutedChanged { audio: bool, video: bool },
    /// `Some(url)` enables transcription with the given sink, `None`
    /// disables it.
    TranscribingChanged { url: Option<String> },
    AvModerationChanged { kind: MediaKind, enabled: bool },
    /// The signaling connection dropped. `resumable` is true when stream
    /// management is active and the session may be resumed.
    SignalingLost { resumable: bool },
    SignalingRestored,
}

/// Handle to a joined (or joinable) multi-user chat room.
#[async_trait]
pub trait ChatRoom: Send + Sync {
    fn jid(&self) -> &RoomJid;

    async fn join(&self) -> Result<(), TransportError>;

    async fn leave(&self);

    /// Current member list (snapshot copy).
    fn members(&self) -> Vec<MemberPresence>;

    fn member(&self, jid: &FullJid) -> Option<MemberPresence>;

    /// Meeting identifier held by the room, if the room assigned one.
    fn meeting_id(&self) -> Option<MeetingId>;

    /// Replace the named extension in the focus occupant's presence and
    /// broadcast it.
    async fn set_presence_extension(&self, name: &str, payload: serde_json::Value);

    fn audio_senders_count(&self) -> usize;

    fn video_senders_count(&self) -> usize;

    /// Whether the room's per-kind unmute whitelist allows the member to
    /// unmute itself.
    fn is_member_allowed_to_unmute(&self, jid: &FullJid, kind: MediaKind) -> bool;

    fn lobby_enabled(&self) -> bool;

    /// Room-level visitor policy override; `None` defers to the global
    /// configuration.
    fn visitors_enabled(&self) -> Option<bool>;

    /// Room-level soft limit override on user participants.
    fn participants_soft_limit(&self) -> Option<usize>;
}

/// The signaling transport: the focus's window to the chat service.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Find or create the room and return a handle plus its event channel.
    /// The room is not joined yet.
    async fn find_or_create_room(
        &self,
        jid: &RoomJid,
    ) -> Result<(Arc<dyn ChatRoom>, mpsc::Receiver<RoomEvent>), TransportError>;

    /// Resolve an endpoint's capabilities. May block on a disco round-trip
    /// for an unseen capability hash, so callers run it on the I/O pool.
    /// Failure degrades to the assumed feature set.
    async fn discover_features(&self, jid: &FullJid, caps_hash: Option<&str>) -> FeatureSet;
}
