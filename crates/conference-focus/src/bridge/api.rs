//! Bridge collaborator interfaces: the selection directory and the
//! wire-level provisioner.

use crate::xmpp::jingle::{IceTransport, MutedKinds};
use async_trait::async_trait;
use common::media::{EndpointSources, MediaKind};
use common::types::{BridgeId, EndpointId, MeetingId, Region, RoomJid};
use thiserror::Error;
use tokio::sync::broadcast;

/// A bridge as known to the selection directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDescriptor {
    pub id: BridgeId,
    pub region: Region,
    /// Software version, matched against a conference pin when present.
    pub version: Option<String>,
}

/// Bridge liveness events from the selection directory.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Added(BridgeDescriptor),
    Removed(BridgeId),
    ShuttingDown(BridgeId),
    FailedHealthCheck(BridgeId),
}

/// What the selector needs to pick a bridge for one participant.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub participant_region: Region,
    /// Bridges already in the conference, preferred for locality.
    pub conference_bridges: Vec<BridgeId>,
    /// Version pin from the registry's pin table, if any.
    pub version_pin: Option<String>,
    pub visitor: bool,
}

/// The external bridge-selection heuristic.
#[async_trait]
pub trait BridgeDirectory: Send + Sync {
    /// Pick a bridge, or `None` when none is operational.
    async fn select(&self, request: &SelectionRequest) -> Option<BridgeDescriptor>;

    /// Subscribe to bridge liveness events.
    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;
}

/// Allocation request for one endpoint.
#[derive(Debug, Clone)]
pub struct ParticipantAllocation {
    pub endpoint: EndpointId,
    pub stats_id: Option<String>,
    pub region: Region,
    pub visitor: bool,
    /// Force-mute decisions derived from room policy and av-moderation.
    pub force_muted: MutedKinds,
    /// Requested media kinds; the data content is flagged separately.
    pub media_kinds: Vec<MediaKind>,
    pub use_sctp: bool,
    pub use_private_addresses: bool,
}

/// A successful channel allocation.
#[derive(Debug, Clone)]
pub struct ColibriAllocation {
    pub bridge: BridgeId,
    /// Identifies this conference's session on the bridge; echoed by peers
    /// in session lifecycle IQs.
    pub bridge_session_id: String,
    pub region: Region,
    pub transport: IceTransport,
    pub sctp_port: Option<u16>,
    /// Bridge-owned feedback sources announced to the endpoint.
    pub feedback_sources: EndpointSources,
}

/// Allocation failures surfaced to the invite runner.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no bridge available")]
    NoBridgeAvailable,

    #[error("conference already exists on the bridge")]
    ConferenceAlreadyExists,

    #[error("allocation failed: {0}")]
    Failed(String),
}

/// Wire-level provisioning failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("conference already exists")]
    ConferenceAlreadyExists,

    #[error("bridge is not responding")]
    BridgeUnresponsive,

    #[error("bridge rejected the request: {0}")]
    Rejected(String),
}

/// Fields of a fire-and-forget endpoint update. Unset fields are left
/// untouched on the bridge.
#[derive(Debug, Clone, Default)]
pub struct EndpointUpdate {
    pub transport: Option<IceTransport>,
    pub sources: Option<EndpointSources>,
    pub initial_last_n: Option<u32>,
    /// Expire the endpoint if still unused after this many seconds.
    pub expire_after_seconds: Option<u64>,
}

/// The bridge wire protocol, one conference at a time. Hides the protocol
/// version from the focus.
#[async_trait]
pub trait BridgeProvisioner: Send + Sync {
    /// Create (or join) the conference on the bridge and allocate channels
    /// for the endpoint. Returns the transport to clone into the offer.
    async fn create_endpoint(
        &self,
        bridge: &BridgeId,
        room: &RoomJid,
        meeting_id: &MeetingId,
        request: &ParticipantAllocation,
    ) -> Result<ColibriAllocation, ProvisionError>;

    /// Patch an existing endpoint.
    async fn update_endpoint(
        &self,
        bridge: &BridgeId,
        room: &RoomJid,
        endpoint: &EndpointId,
        update: &EndpointUpdate,
    ) -> Result<(), ProvisionError>;

    /// Expire one endpoint's channels.
    async fn expire_endpoint(
        &self,
        bridge: &BridgeId,
        room: &RoomJid,
        endpoint: &EndpointId,
    ) -> Result<(), ProvisionError>;

    /// Expire the whole conference on the bridge.
    async fn expire_conference(&self, bridge: &BridgeId, room: &RoomJid)
        -> Result<(), ProvisionError>;

    /// Force-mute endpoints at the bridge.
    async fn force_mute(
        &self,
        bridge: &BridgeId,
        room: &RoomJid,
        endpoints: &[EndpointId],
        kind: MediaKind,
        muted: bool,
    ) -> Result<(), ProvisionError>;

    /// Point the bridge's transcription pipeline at a sink, or clear it.
    async fn set_transcriber_url(
        &self,
        bridge: &BridgeId,
        room: &RoomJid,
        url: Option<&str>,
    ) -> Result<(), ProvisionError>;
}
