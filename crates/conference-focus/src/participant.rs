//! Per-endpoint participant state.
//!
//! A participant record is created the first time the conference observes
//! the member with a recognized role, and destroyed when the member
//! leaves, is kicked, or is terminated by the coordinator. Records are
//! never reused.

use crate::sources::queue::SignalingQueue;
use common::features::FeatureSet;
use common::role::Role;
use common::types::{EndpointId, FullJid, Region};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Minimum spacing between session-restart requests.
const RESTART_MIN_INTERVAL_SECONDS: u64 = 10;

/// Sliding window for the restart budget.
const RESTART_WINDOW_SECONDS: u64 = 60;

/// Restart requests allowed within the window.
const RESTART_MAX_IN_WINDOW: usize = 3;

/// Sliding-window limiter for session-restart requests: at most one per
/// 10 seconds and three per minute.
#[derive(Debug, Default)]
pub struct RestartRateLimit {
    requests: VecDeque<Instant>,
}

impl RestartRateLimit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request; returns false when it must be rejected.
    pub fn accept(&mut self) -> bool {
        let now = Instant::now();
        let window = std::time::Duration::from_secs(RESTART_WINDOW_SECONDS);
        while let Some(oldest) = self.requests.front() {
            if now.duration_since(*oldest) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }

        let too_soon = self.requests.back().is_some_and(|last| {
            now.duration_since(*last) < std::time::Duration::from_secs(RESTART_MIN_INTERVAL_SECONDS)
        });
        if too_soon || self.requests.len() >= RESTART_MAX_IN_WINDOW {
            return false;
        }

        self.requests.push_back(now);
        true
    }
}

/// State of the participant's media session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session and no invite in flight.
    None,
    /// An invite runner is working on this participant.
    Inviting,
    /// An offer went out; waiting for the peer to accept.
    Offered { bridge_session_id: String },
    /// The peer accepted; media is flowing.
    Active { bridge_session_id: String },
}

impl SessionState {
    /// The live bridge session id, if any.
    #[must_use]
    pub fn bridge_session_id(&self) -> Option<&str> {
        match self {
            SessionState::Offered { bridge_session_id }
            | SessionState::Active { bridge_session_id } => Some(bridge_session_id),
            _ => None,
        }
    }
}

/// Per-endpoint state owned by the conference coordinator.
pub struct Participant {
    /// Room-local nickname.
    pub endpoint: EndpointId,
    /// Full occupant address.
    pub jid: FullJid,
    /// Immutable capability snapshot taken at creation.
    pub features: FeatureSet,
    /// Role snapshot taken at creation.
    pub role: Role,
    pub stats_id: Option<String>,
    pub region: Region,
    /// Whether this participant lives in a visitor room.
    pub visitor: bool,
    /// Whether this member is a trusted server-side component.
    pub trusted_component: bool,
    pub session: SessionState,
    /// Cancellation flag of the outstanding invite runner, if one exists.
    invite_cancel: Option<Arc<AtomicBool>>,
    /// Restart-request limiter.
    pub restart_limit: RestartRateLimit,
    /// Last observed desktop-mute flag from presence.
    pub desktop_muted: bool,
    /// Outbound source-signaling coalescer toward this peer.
    pub queue: SignalingQueue,
}

/// Summary of a participant for snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSummary {
    pub endpoint: EndpointId,
    pub role: Role,
    pub visitor: bool,
    pub has_session: bool,
    pub delivered_sources: usize,
}

impl Participant {
    #[must_use]
    pub fn new(
        endpoint: EndpointId,
        jid: FullJid,
        features: FeatureSet,
        role: Role,
    ) -> Self {
        Self {
            endpoint,
            jid,
            features,
            role,
            stats_id: None,
            region: Region::default(),
            visitor: false,
            trusted_component: false,
            session: SessionState::None,
            invite_cancel: None,
            restart_limit: RestartRateLimit::new(),
            desktop_muted: false,
            queue: SignalingQueue::new(),
        }
    }

    /// Install a new invite runner's cancellation flag, canceling any
    /// previous runner. At most one runner is live per participant.
    pub fn set_invite(&mut self, cancel: Arc<AtomicBool>) {
        if let Some(previous) = self.invite_cancel.replace(cancel) {
            previous.store(true, Ordering::Release);
        }
        self.session = SessionState::Inviting;
    }

    /// Cancel the outstanding invite runner, if any.
    pub fn cancel_invite(&mut self) {
        if let Some(flag) = self.invite_cancel.take() {
            flag.store(true, Ordering::Release);
        }
    }

    /// Whether an invite runner is outstanding.
    #[must_use]
    pub fn has_pending_invite(&self) -> bool {
        self.invite_cancel
            .as_ref()
            .is_some_and(|flag| !flag.load(Ordering::Acquire))
    }

    /// Clear the runner flag once its outcome is processed.
    pub fn clear_invite(&mut self) {
        self.invite_cancel = None;
    }

    /// Whether `runner` is the currently installed invite runner. Stale
    /// outcomes from a superseded runner must be ignored.
    #[must_use]
    pub fn is_current_invite(&self, runner: &Arc<AtomicBool>) -> bool {
        self.invite_cancel
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, runner))
    }

    #[must_use]
    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            endpoint: self.endpoint.clone(),
            role: self.role,
            visitor: self.visitor,
            has_session: matches!(self.session, SessionState::Active { .. }),
            delivered_sources: self.queue.delivered_count(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::features::Feature;
    use std::time::Duration;

    fn participant() -> Participant {
        Participant::new(
            EndpointId::new("alice"),
            FullJid::parse("room@muc.example.com/alice").unwrap(),
            FeatureSet::new([Feature::Audio, Feature::Video]),
            Role::Member,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_limit_min_interval() {
        let mut limit = RestartRateLimit::new();
        assert!(limit.accept());
        // a second request within 10 seconds is rejected
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!limit.accept());
        // once the interval passed it is accepted again
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limit.accept());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_limit_window_budget() {
        let mut limit = RestartRateLimit::new();
        for _ in 0..3 {
            assert!(limit.accept());
            tokio::time::advance(Duration::from_secs(11)).await;
        }
        // fourth within the minute is rejected even though spacing is fine
        assert!(!limit.accept());

        // window slides: after the first request ages out, one more fits
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limit.accept());
    }

    #[test]
    fn test_set_invite_cancels_previous_runner() {
        let mut p = participant();
        let first = Arc::new(AtomicBool::new(false));
        p.set_invite(Arc::clone(&first));
        assert!(p.has_pending_invite());

        let second = Arc::new(AtomicBool::new(false));
        p.set_invite(Arc::clone(&second));

        assert!(first.load(Ordering::Acquire), "previous runner must be canceled");
        assert!(!second.load(Ordering::Acquire));
        assert!(p.has_pending_invite());
    }

    #[test]
    fn test_cancel_invite() {
        let mut p = participant();
        let flag = Arc::new(AtomicBool::new(false));
        p.set_invite(Arc::clone(&flag));
        p.cancel_invite();
        assert!(flag.load(Ordering::Acquire));
        assert!(!p.has_pending_invite());
    }

    #[test]
    fn test_session_state_ids() {
        let mut p = participant();
        assert!(p.session.bridge_session_id().is_none());
        p.session = SessionState::Active {
            bridge_session_id: "bs-1".to_string(),
        };
        assert_eq!(p.session.bridge_session_id(), Some("bs-1"));
    }
}
