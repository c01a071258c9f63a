//! The invite runner: a single-shot, cancelable unit of work that
//! allocates channels on a bridge and drives one session-initiate or
//! transport-replace.
//!
//! The runner checks its soft cancellation flag between blocking stages
//! and delivers no side effects once it observes it. The coordinator
//! guarantees at most one live runner per participant by canceling the
//! previous flag when installing a new one.

use super::messages::{ConferenceMessage, InviteOutcome};
use crate::bridge::{
    AllocationError, BridgeSessionManager, ColibriAllocation, ParticipantAllocation,
};
use crate::errors::FocusError;
use crate::sources::compat::filter_for_receiver;
use crate::sources::registry::ConferenceSources;
use crate::sources::SourceMap;
use crate::xmpp::jingle::{
    ContentDescription, MediaSignaling, MutedKinds, SctpMap, SessionOffer,
};
use common::features::{Feature, FeatureSet};
use common::types::{EndpointId, FullJid, Region};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Owner key under which bridge feedback sources ride in an offer.
pub const FEEDBACK_OWNER: &str = "jvb";

/// Default number of SCTP streams announced in the data content.
const SCTP_STREAMS: u16 = 1024;

/// Everything one invite needs, captured at launch time.
pub struct InviteRunner {
    pub endpoint: EndpointId,
    pub jid: FullJid,
    pub features: FeatureSet,
    pub stats_id: Option<String>,
    pub region: Region,
    pub visitor: bool,
    /// Transport-replace instead of a fresh session-initiate.
    pub reinvite: bool,
    pub force_muted: MutedKinds,
    pub use_private_addresses: bool,
    pub version_pin: Option<String>,
    pub cancel: Arc<AtomicBool>,
    pub sessions: Arc<BridgeSessionManager>,
    pub sources: Arc<ConferenceSources>,
    pub signaling: Arc<dyn MediaSignaling>,
    pub mailbox: mpsc::Sender<ConferenceMessage>,
}

impl InviteRunner {
    /// Run the invite to completion, cancellation, or failure.
    pub async fn run(self) {
        let outcome = self.drive().await;
        let message = ConferenceMessage::InviteFinished {
            endpoint: self.endpoint.clone(),
            runner: Arc::clone(&self.cancel),
            outcome,
        };
        if self.mailbox.send(message).await.is_err() {
            debug!(
                target: "focus.invite",
                endpoint = %self.endpoint,
                "Conference gone before invite outcome could be delivered"
            );
        }
    }

    fn canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    async fn drive(&self) -> InviteOutcome {
        if self.canceled() {
            return InviteOutcome::Canceled;
        }

        let request = ParticipantAllocation {
            endpoint: self.endpoint.clone(),
            stats_id: self.stats_id.clone(),
            region: self.region.clone(),
            visitor: self.visitor,
            force_muted: self.force_muted,
            media_kinds: self.features.media_kinds(),
            use_sctp: self.features.contains(Feature::Sctp),
            use_private_addresses: self.use_private_addresses,
        };

        let allocation = match self.sessions.allocate(&request, self.version_pin.clone()).await {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!(
                    target: "focus.invite",
                    endpoint = %self.endpoint,
                    error = %e,
                    "Channel allocation failed"
                );
                let error = match e {
                    AllocationError::NoBridgeAvailable => FocusError::BridgeUnavailable,
                    other => FocusError::AllocationFailed(other.to_string()),
                };
                return InviteOutcome::Failed { error };
            }
        };

        if self.canceled() {
            self.sessions.remove_participant(&self.endpoint).await;
            return InviteOutcome::Canceled;
        }

        let (offer, initial) = self.build_offer(&allocation);

        if self.canceled() {
            self.sessions.remove_participant(&self.endpoint).await;
            return InviteOutcome::Canceled;
        }

        let acked = if self.reinvite {
            self.signaling.replace_transport(&self.jid, offer).await
        } else {
            self.signaling.initiate_session(&self.jid, offer).await
        };

        match acked {
            Ok(true) => {
                info!(
                    target: "focus.invite",
                    endpoint = %self.endpoint,
                    bridge = %allocation.bridge,
                    reinvite = self.reinvite,
                    "Offer acknowledged"
                );
                InviteOutcome::Sent {
                    bridge_session_id: allocation.bridge_session_id,
                    initial,
                }
            }
            Ok(false) => {
                // no acknowledgement: expire the channels and report
                self.sessions.remove_participant(&self.endpoint).await;
                InviteOutcome::Failed {
                    error: FocusError::Transport("offer was not acknowledged".to_string()),
                }
            }
            Err(e) => {
                self.sessions.remove_participant(&self.endpoint).await;
                InviteOutcome::Failed {
                    error: FocusError::Transport(e.to_string()),
                }
            }
        }
    }

    /// Build the annotated offer: contents from the feature-adjusted
    /// capabilities, the allocation's transport cloned in, the SCTP map
    /// when data was requested, and the conference-wide sources minus the
    /// participant's own, post-filter.
    fn build_offer(&self, allocation: &ColibriAllocation) -> (SessionOffer, SourceMap) {
        let contents: Vec<ContentDescription> = self
            .features
            .media_kinds()
            .into_iter()
            .map(|kind| ContentDescription { kind })
            .collect();

        let mut sources = filter_for_receiver(
            &self.features,
            self.sources.snapshot_excluding(&self.endpoint),
        );
        if !allocation.feedback_sources.is_empty() {
            sources.insert(
                EndpointId::new(FEEDBACK_OWNER),
                allocation.feedback_sources.clone(),
            );
        }

        let sctp = (self.features.contains(Feature::Sctp))
            .then_some(())
            .and(allocation.sctp_port)
            .map(|port| SctpMap {
                port,
                streams: SCTP_STREAMS,
            });

        let offer = SessionOffer {
            contents,
            transport: allocation.transport.clone(),
            sctp,
            sources: sources.clone(),
            start_muted: self.force_muted,
        };
        (offer, sources)
    }
}
