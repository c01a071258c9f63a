//! The conference mailbox: every transition of a conference flows through
//! this tagged union, consumed by the coordinator's single actor loop.

use super::ConferenceSnapshot;
use crate::bridge::BridgeSessionEvent;
use crate::errors::FocusError;
use crate::sources::SourceMap;
use crate::xmpp::jingle::IceTransport;
use crate::xmpp::presence::MemberPresence;
use crate::xmpp::room::{RoomEvent, TransportError};
use common::features::FeatureSet;
use common::media::{EndpointSources, MediaKind};
use common::types::{BridgeId, EndpointId};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Result of a mute request, reported to the requesting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteResult {
    Success,
    NotAllowed,
    Error,
}

/// Which timer fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Empty-conference deadline.
    ConferenceStart,
    /// Lone-participant deadline.
    SingleParticipant,
    /// Signaling resumption deadline.
    Reconnect,
    /// Coalesced source-signaling flush for one participant.
    SourceSignaling(EndpointId),
}

/// What an invite runner reports back.
#[derive(Debug)]
pub enum InviteOutcome {
    /// The offer went out and was acknowledged.
    Sent {
        bridge_session_id: String,
        /// The filtered source image that left on the initiate.
        initial: SourceMap,
    },
    /// The runner observed its cancellation flag and backed out.
    Canceled,
    /// The runner hit a terminal error; the participant is terminated.
    Failed { error: FocusError },
}

/// Messages consumed by the conference actor.
pub enum ConferenceMessage {
    Start {
        respond_to: oneshot::Sender<Result<(), FocusError>>,
    },
    Stop {
        respond_to: Option<oneshot::Sender<()>>,
    },
    AddSource {
        endpoint: EndpointId,
        sources: EndpointSources,
        respond_to: oneshot::Sender<Result<EndpointSources, FocusError>>,
    },
    RemoveSource {
        endpoint: EndpointId,
        sources: EndpointSources,
        respond_to: oneshot::Sender<Result<EndpointSources, FocusError>>,
    },
    AcceptSession {
        endpoint: EndpointId,
        sources: EndpointSources,
        transport: Option<IceTransport>,
        initial_last_n: Option<u32>,
        respond_to: oneshot::Sender<Result<(), FocusError>>,
    },
    TerminateSession {
        endpoint: EndpointId,
        bridge_session_id: String,
        reinvite: bool,
        respond_to: oneshot::Sender<Result<(), FocusError>>,
    },
    IceFailed {
        endpoint: EndpointId,
        bridge_session_id: String,
    },
    MuteRequest {
        muter: EndpointId,
        target: EndpointId,
        kind: MediaKind,
        mute: bool,
        respond_to: oneshot::Sender<MuteResult>,
    },
    MuteAll {
        kind: MediaKind,
        actor: EndpointId,
        respond_to: oneshot::Sender<MuteResult>,
    },
    MoveEndpoints {
        endpoints: Vec<EndpointId>,
        respond_to: oneshot::Sender<usize>,
    },
    MoveBridgeEndpoints {
        bridge: BridgeId,
        count: Option<usize>,
        respond_to: oneshot::Sender<usize>,
    },
    RedirectVisitor {
        visitor_requested: bool,
        respond_to: oneshot::Sender<Option<String>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<ConferenceSnapshot>,
    },
    /// Feature discovery for a member finished on the I/O pool.
    MemberResolved {
        presence: MemberPresence,
        features: FeatureSet,
        /// Set when the member lives in a visitor room.
        visitor_node: Option<String>,
    },
    /// An invite runner finished. `runner` identifies which runner, so a
    /// stale outcome (superseded by a newer invite) is ignored.
    InviteFinished {
        endpoint: EndpointId,
        runner: Arc<AtomicBool>,
        outcome: InviteOutcome,
    },
    Timer(TimerKind),
    /// Event from this conference's bridge-session manager.
    BridgeSession(BridgeSessionEvent),
    /// A visitor mirror-room join finished on the I/O pool.
    VisitorRoomJoined {
        node: String,
        result: Result<Arc<dyn crate::xmpp::room::ChatRoom>, TransportError>,
    },
    /// Event observed in a visitor mirror room.
    VisitorRoom {
        node: String,
        event: RoomEvent,
    },
}
