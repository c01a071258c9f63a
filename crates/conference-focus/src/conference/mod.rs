//! The per-conference coordinator.
//!
//! A conference is an actor: `Conference::spawn` returns a cloneable
//! [`ConferenceHandle`] (mailbox sender plus cancellation token) and the
//! actor task. All transitions that cross component boundaries flow
//! through the mailbox, which serializes every mutation of conference
//! state in one consumer loop.

mod actor;
pub mod invite;
pub mod messages;
pub mod mute;
pub mod properties;
pub mod visitors;

use crate::errors::FocusError;
use crate::participant::ParticipantSummary;
use crate::registry::{FocusRegistry, FocusServices};
use crate::xmpp::jingle::IceTransport;
use crate::xmpp::room::{ChatRoom, RoomEvent};
use chrono::{DateTime, Utc};
use common::media::{EndpointSources, MediaKind};
use common::types::{BridgeId, EndpointId, RoomJid};
use messages::{ConferenceMessage, MuteResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Mailbox depth of a conference actor.
const CONFERENCE_CHANNEL_BUFFER: usize = 500;

/// Static description of a conference to create.
#[derive(Debug, Clone)]
pub struct ConferenceOptions {
    pub room: RoomJid,
    /// Set when this conference is a breakout of another room; feeds the
    /// main room's stop policy.
    pub main_room: Option<RoomJid>,
}

/// Conference lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Joining,
    Running,
    Stopped,
}

impl Lifecycle {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Joining => "joining",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        }
    }
}

/// Serializable debug snapshot of one conference.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConferenceSnapshot {
    pub room: String,
    pub meeting_id: Option<String>,
    pub state: String,
    pub participants: Vec<ParticipantSummary>,
    pub bridge_count: usize,
    pub properties: BTreeMap<String, String>,
    pub visitor_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Handle to a conference actor.
#[derive(Clone, Debug)]
pub struct ConferenceHandle {
    sender: mpsc::Sender<ConferenceMessage>,
    cancel_token: CancellationToken,
    room: RoomJid,
}

pub struct Conference;

impl Conference {
    /// Spawn the conference actor. The room handle and its event channel
    /// come pre-resolved from the transport; the room is not joined until
    /// `start`.
    #[must_use]
    pub fn spawn(
        options: ConferenceOptions,
        services: Arc<FocusServices>,
        registry: Arc<FocusRegistry>,
        room: Arc<dyn ChatRoom>,
        room_events: mpsc::Receiver<RoomEvent>,
    ) -> (ConferenceHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONFERENCE_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let handle = ConferenceHandle {
            sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            room: options.room.clone(),
        };

        let actor = actor::ConferenceActor::new(
            options,
            services,
            registry,
            room,
            room_events,
            receiver,
            sender,
            cancel_token,
        );
        let task = tokio::spawn(actor.run());

        (handle, task)
    }
}

impl ConferenceHandle {
    #[must_use]
    pub fn room(&self) -> &RoomJid {
        &self.room
    }

    /// Whether the actor has been told to shut down.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }

    /// Join the room and bring the conference to Running. Fails when
    /// already started or when the meeting identifier collides.
    pub async fn start(&self) -> Result<(), FocusError> {
        self.request(|respond_to| ConferenceMessage::Start { respond_to })
            .await?
    }

    /// Stop the conference. Idempotent: stopping a stopped conference is
    /// a no-op.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConferenceMessage::Stop {
                respond_to: Some(tx),
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn add_source(
        &self,
        endpoint: EndpointId,
        sources: EndpointSources,
    ) -> Result<EndpointSources, FocusError> {
        self.request(|respond_to| ConferenceMessage::AddSource {
            endpoint,
            sources,
            respond_to,
        })
        .await?
    }

    pub async fn remove_source(
        &self,
        endpoint: EndpointId,
        sources: EndpointSources,
    ) -> Result<EndpointSources, FocusError> {
        self.request(|respond_to| ConferenceMessage::RemoveSource {
            endpoint,
            sources,
            respond_to,
        })
        .await?
    }

    pub async fn accept_session(
        &self,
        endpoint: EndpointId,
        sources: EndpointSources,
        transport: Option<IceTransport>,
        initial_last_n: Option<u32>,
    ) -> Result<(), FocusError> {
        self.request(|respond_to| ConferenceMessage::AcceptSession {
            endpoint,
            sources,
            transport,
            initial_last_n,
            respond_to,
        })
        .await?
    }

    pub async fn terminate_session(
        &self,
        endpoint: EndpointId,
        bridge_session_id: String,
        reinvite: bool,
    ) -> Result<(), FocusError> {
        self.request(|respond_to| ConferenceMessage::TerminateSession {
            endpoint,
            bridge_session_id,
            reinvite,
            respond_to,
        })
        .await?
    }

    /// Notify an ICE failure; a mismatching session id is ignored.
    pub async fn ice_failed(&self, endpoint: EndpointId, bridge_session_id: String) {
        let _ = self
            .sender
            .send(ConferenceMessage::IceFailed {
                endpoint,
                bridge_session_id,
            })
            .await;
    }

    pub async fn mute_request(
        &self,
        muter: EndpointId,
        target: EndpointId,
        kind: MediaKind,
        mute: bool,
    ) -> MuteResult {
        self.request(|respond_to| ConferenceMessage::MuteRequest {
            muter,
            target,
            kind,
            mute,
            respond_to,
        })
        .await
        .unwrap_or(MuteResult::Error)
    }

    /// Best-effort broadcast mute by a moderator.
    pub async fn mute_all(&self, kind: MediaKind, actor: EndpointId) -> MuteResult {
        self.request(|respond_to| ConferenceMessage::MuteAll {
            kind,
            actor,
            respond_to,
        })
        .await
        .unwrap_or(MuteResult::Error)
    }

    /// Move endpoints off their current bridges; returns how many were
    /// re-invited.
    pub async fn move_endpoints(&self, endpoints: Vec<EndpointId>) -> usize {
        self.request(|respond_to| ConferenceMessage::MoveEndpoints {
            endpoints,
            respond_to,
        })
        .await
        .unwrap_or(0)
    }

    /// Move up to `count` endpoints off the given bridge (all when
    /// `None`); returns how many were re-invited.
    pub async fn move_bridge_endpoints(
        &self,
        bridge: BridgeId,
        count: Option<usize>,
    ) -> usize {
        self.request(|respond_to| ConferenceMessage::MoveBridgeEndpoints {
            bridge,
            count,
            respond_to,
        })
        .await
        .unwrap_or(0)
    }

    /// Decide whether a joining endpoint should be redirected to a
    /// visitor node; returns the node name if so. Called before the
    /// endpoint enters the main room.
    pub async fn redirect_visitor(&self, visitor_requested: bool) -> Option<String> {
        self.request(|respond_to| ConferenceMessage::RedirectVisitor {
            visitor_requested,
            respond_to,
        })
        .await
        .unwrap_or(None)
    }

    pub async fn snapshot(&self) -> Result<ConferenceSnapshot, FocusError> {
        self.request(|respond_to| ConferenceMessage::Snapshot { respond_to })
            .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ConferenceMessage,
    ) -> Result<T, FocusError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| FocusError::Internal("conference mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| FocusError::Internal("conference dropped the request".to_string()))
    }
}
