//! Session negotiation types and the media-signaling collaborator.
//!
//! The concrete wire encoding is out of scope; these types carry exactly
//! what the focus decides: which contents an offer has, which transport and
//! sources annotate it, and how sessions are terminated.

use crate::sources::SourceMap;
use async_trait::async_trait;
use common::media::MediaKind;
use common::types::FullJid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-kind mute flags, used for force-mute decisions and the start-muted
/// directive of an offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutedKinds {
    pub audio: bool,
    pub video: bool,
}

impl MutedKinds {
    #[must_use]
    pub fn get(self, kind: MediaKind) -> bool {
        match kind.bridge_kind() {
            MediaKind::Audio => self.audio,
            _ => self.video,
        }
    }

    pub fn set(&mut self, kind: MediaKind, muted: bool) {
        match kind.bridge_kind() {
            MediaKind::Audio => self.audio = muted,
            _ => self.video = muted,
        }
    }
}

/// One negotiated content line of an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescription {
    pub kind: MediaKind,
}

/// ICE/DTLS transport description, cloned from a bridge allocation into
/// the offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceTransport {
    pub ufrag: String,
    pub pwd: String,
    pub fingerprint: String,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default = "default_true")]
    pub rtcp_mux: bool,
}

fn default_true() -> bool {
    true
}

/// SCTP mapping for the data content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SctpMap {
    pub port: u16,
    pub streams: u16,
}

/// A complete offer: session-initiate or transport-replace payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOffer {
    /// Media contents, derived from the participant's features. The data
    /// content is represented by `sctp`, not by a media kind.
    pub contents: Vec<ContentDescription>,
    pub transport: IceTransport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp: Option<SctpMap>,
    /// Conference-wide sources minus the participant's own, post-filter.
    pub sources: SourceMap,
    /// Start-muted directive derived from room policy and av-moderation.
    #[serde(default)]
    pub start_muted: MutedKinds,
}

/// Reason carried on a session-terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateReason {
    /// Normal teardown.
    Gone,
    /// The focus expired an idle or lone session.
    Expired,
    /// Something went wrong on the focus side.
    GeneralError,
    /// Transport establishment failed.
    ConnectivityError,
}

/// Media-signaling failures.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("peer did not acknowledge")]
    NotAcknowledged,

    #[error("send failed: {0}")]
    Send(String),

    #[error("request timed out")]
    Timeout,
}

/// The Jingle-shaped signaling collaborator, keyed by occupant address.
#[async_trait]
pub trait MediaSignaling: Send + Sync {
    /// Send a session-initiate; resolves true when the peer acknowledged.
    async fn initiate_session(
        &self,
        to: &FullJid,
        offer: SessionOffer,
    ) -> Result<bool, SignalingError>;

    /// Send a transport-replace for an existing session; resolves true
    /// when the peer acknowledged.
    async fn replace_transport(
        &self,
        to: &FullJid,
        offer: SessionOffer,
    ) -> Result<bool, SignalingError>;

    /// Terminate the session. `allow_restart` tells the peer whether a
    /// fresh session request is welcome.
    async fn terminate_session(
        &self,
        to: &FullJid,
        reason: TerminateReason,
        allow_restart: bool,
    ) -> Result<(), SignalingError>;

    /// Signal added sources of other endpoints to this peer.
    async fn source_add(&self, to: &FullJid, sources: SourceMap) -> Result<(), SignalingError>;

    /// Signal removed sources of other endpoints to this peer.
    async fn source_remove(&self, to: &FullJid, sources: SourceMap)
        -> Result<(), SignalingError>;

    /// Tell the peer it has been muted (or may unmute) for a kind.
    async fn request_mute(
        &self,
        to: &FullJid,
        kind: MediaKind,
        mute: bool,
    ) -> Result<(), SignalingError>;
}
