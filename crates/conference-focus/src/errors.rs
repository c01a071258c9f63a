//! Focus error types.
//!
//! Errors that cross the coordinator surface map to XMPP stanza error
//! conditions for the IQ response to the peer. Internal details are logged
//! server-side and never leave the process.

use common::media::{MediaKind, Ssrc};
use common::types::{EndpointId, MeetingId};
use thiserror::Error;

/// Errors surfaced by the conference coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum FocusError {
    /// A source set would break registry invariants; the caller keeps its
    /// prior state.
    #[error("source validation failed: {0}")]
    ValidationFailed(#[from] SourceError),

    /// The room's sender limit for the given kind is reached.
    #[error("sender limit reached for {0}")]
    SenderLimitExceeded(MediaKind),

    /// The bridge session id presented by the peer does not match the live
    /// session; the request is ignored.
    #[error("bridge session id does not match the active session")]
    InvalidBridgeSession,

    /// No bridge was available for allocation.
    #[error("no bridge available")]
    BridgeUnavailable,

    /// A bridge rejected the allocation.
    #[error("channel allocation failed: {0}")]
    AllocationFailed(String),

    /// A second conference tried to claim a live meeting identifier.
    #[error("meeting identifier already in use: {0}")]
    MeetingIdCollision(MeetingId),

    /// Permission denied by the mute/unmute policy.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// `start` was called on a conference that already started.
    #[error("conference already started")]
    AlreadyStarted,

    /// An operation arrived before the conference was running.
    #[error("conference not started")]
    NotStarted,

    /// The addressed participant is not in the conference.
    #[error("no such participant: {0}")]
    ParticipantNotFound(EndpointId),

    /// The signaling transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal error, e.g. a closed mailbox during shutdown.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FocusError {
    /// The stanza error condition used when answering the originating IQ.
    #[must_use]
    pub fn condition(&self) -> &'static str {
        match self {
            FocusError::ValidationFailed(_) | FocusError::InvalidBridgeSession => "bad-request",
            FocusError::SenderLimitExceeded(_) => "resource-constraint",
            FocusError::BridgeUnavailable | FocusError::AllocationFailed(_) => {
                "service-unavailable"
            }
            FocusError::MeetingIdCollision(_) | FocusError::AlreadyStarted => "conflict",
            FocusError::NotAllowed(_) => "not-allowed",
            FocusError::NotStarted | FocusError::ParticipantNotFound(_) => "item-not-found",
            FocusError::Transport(_) | FocusError::Internal(_) => "internal-server-error",
        }
    }
}

/// Source registry validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The ssrc is already advertised by another endpoint.
    #[error("ssrc {0} is owned by another endpoint")]
    Conflict(Ssrc),

    /// The same ssrc appears twice in the submitted set.
    #[error("ssrc {0} appears more than once")]
    Duplicate(Ssrc),

    /// The endpoint would exceed its source budget.
    #[error("source count {count} exceeds the limit of {limit}")]
    TooManySources { count: usize, limit: usize },

    /// The endpoint would exceed its group budget.
    #[error("group count {count} exceeds the limit of {limit}")]
    TooManyGroups { count: usize, limit: usize },

    /// A group references an ssrc that is not in the endpoint's flat set.
    #[error("group references unknown ssrc {0}")]
    GroupMemberMissing(Ssrc),

    /// A removal names an ssrc the endpoint does not own.
    #[error("ssrc {0} is not owned by the requesting endpoint")]
    NotOwned(Ssrc),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_mapping() {
        assert_eq!(
            FocusError::ValidationFailed(SourceError::Conflict(Ssrc(1))).condition(),
            "bad-request"
        );
        assert_eq!(
            FocusError::SenderLimitExceeded(MediaKind::Audio).condition(),
            "resource-constraint"
        );
        assert_eq!(FocusError::BridgeUnavailable.condition(), "service-unavailable");
        assert_eq!(
            FocusError::MeetingIdCollision(MeetingId::new("m1")).condition(),
            "conflict"
        );
        assert_eq!(
            FocusError::NotAllowed("mute denied".into()).condition(),
            "not-allowed"
        );
        assert_eq!(
            FocusError::ParticipantNotFound(EndpointId::new("ep")).condition(),
            "item-not-found"
        );
        assert_eq!(FocusError::Internal("boom".into()).condition(), "internal-server-error");
    }

    #[test]
    fn test_source_error_converts() {
        let err: FocusError = SourceError::NotOwned(Ssrc(7)).into();
        assert!(matches!(err, FocusError::ValidationFailed(_)));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", FocusError::SenderLimitExceeded(MediaKind::Video)),
            "sender limit reached for video"
        );
        assert_eq!(
            format!("{}", SourceError::TooManySources { count: 51, limit: 50 }),
            "source count 51 exceeds the limit of 50"
        );
    }
}
