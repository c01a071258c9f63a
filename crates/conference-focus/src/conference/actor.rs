//! The conference coordinator loop.
//!
//! Single owner of a conference's mutable state. The loop consumes the
//! mailbox, the room event channel and the bridge-directory event stream;
//! everything that blocks (allocation, feature discovery, visitor-room
//! joins, invite runners) is offloaded to the I/O pool and reports back
//! through the mailbox.

use super::invite::{InviteRunner, FEEDBACK_OWNER};
use super::messages::{ConferenceMessage, InviteOutcome, MuteResult, TimerKind};
use super::mute::{check_mute_request, force_mute_on_invite, may_force_mute, AvModeration};
use super::properties::{self, ConferenceProperties};
use super::visitors::{visitor_room_jid, VisitorRoom, VisitorRoomState};
use super::{ConferenceOptions, ConferenceSnapshot, Lifecycle};
use crate::bridge::{BridgeEvent, BridgeSessionEvent, BridgeSessionManager, EndpointUpdate};
use crate::errors::FocusError;
use crate::participant::{Participant, SessionState};
use crate::registry::{FocusRegistry, FocusServices};
use crate::sources::compat::filter_for_receiver;
use crate::sources::registry::{ConferenceSources, SourceLimits};
use crate::tasks::ScheduledTimeout;
use crate::xmpp::jingle::{MutedKinds, TerminateReason};
use crate::xmpp::presence::MemberPresence;
use crate::xmpp::room::{ChatRoom, RoomEvent};
use common::media::{EndpointSources, MediaKind};
use common::role::Role;
use common::types::{BridgeId, EndpointId, MeetingId, RoomJid};
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub(crate) struct ConferenceActor {
    room_jid: RoomJid,
    main_room: Option<RoomJid>,
    services: Arc<FocusServices>,
    registry: Arc<FocusRegistry>,
    room: Arc<dyn ChatRoom>,
    room_events: mpsc::Receiver<RoomEvent>,
    receiver: mpsc::Receiver<ConferenceMessage>,
    self_sender: mpsc::Sender<ConferenceMessage>,
    cancel_token: CancellationToken,
    bridge_events: broadcast::Receiver<BridgeEvent>,
    bridge_events_closed: bool,

    state: Lifecycle,
    meeting_id: Option<MeetingId>,
    sessions: Option<Arc<BridgeSessionManager>>,
    sources: Arc<ConferenceSources>,

    /// Main-room occupants by nickname, participants or not.
    members: HashMap<EndpointId, MemberPresence>,
    participants: HashMap<EndpointId, Participant>,
    /// Endpoints with feature discovery in flight.
    pending_discovery: HashSet<EndpointId>,

    properties: ConferenceProperties,
    start_muted: MutedKinds,
    av_moderation: AvModeration,

    start_timeout: Option<ScheduledTimeout>,
    single_timeout: Option<ScheduledTimeout>,
    reconnect_timeout: Option<ScheduledTimeout>,
    flush_timers: HashMap<EndpointId, ScheduledTimeout>,

    visitor_rooms: HashMap<String, VisitorRoom>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl ConferenceActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        options: ConferenceOptions,
        services: Arc<FocusServices>,
        registry: Arc<FocusRegistry>,
        room: Arc<dyn ChatRoom>,
        room_events: mpsc::Receiver<RoomEvent>,
        receiver: mpsc::Receiver<ConferenceMessage>,
        self_sender: mpsc::Sender<ConferenceMessage>,
        cancel_token: CancellationToken,
    ) -> Self {
        let sources = Arc::new(ConferenceSources::new(SourceLimits {
            max_sources: services.config.max_sources,
            max_groups: services.config.max_source_groups,
        }));
        let bridge_events = services.bridge_directory.subscribe();

        Self {
            room_jid: options.room,
            main_room: options.main_room,
            registry,
            room,
            room_events,
            receiver,
            self_sender,
            cancel_token,
            bridge_events,
            bridge_events_closed: false,
            state: Lifecycle::Created,
            meeting_id: None,
            sessions: None,
            sources,
            members: HashMap::new(),
            participants: HashMap::new(),
            pending_discovery: HashSet::new(),
            properties: ConferenceProperties::new(),
            start_muted: MutedKinds::default(),
            av_moderation: AvModeration::default(),
            start_timeout: None,
            single_timeout: None,
            reconnect_timeout: None,
            flush_timers: HashMap::new(),
            visitor_rooms: HashMap::new(),
            created_at: chrono::Utc::now(),
            services,
        }
    }

    #[instrument(skip_all, name = "focus.conference", fields(room = %self.room_jid))]
    pub(crate) async fn run(mut self) {
        info!(target: "focus.conference", room = %self.room_jid, "Conference actor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.stop("canceled").await;
                }

                msg = self.receiver.recv() => match msg {
                    Some(message) => self.handle_message(message).await,
                    None => self.stop("mailbox closed").await,
                },

                event = self.room_events.recv() => match event {
                    Some(event) => self.handle_room_event(event).await,
                    // the transport dropped the room channel: signaling is
                    // gone without resumption
                    None => self.handle_room_event(RoomEvent::SignalingLost { resumable: false }).await,
                },

                event = self.bridge_events.recv(), if !self.bridge_events_closed => {
                    match event {
                        Ok(event) => self.handle_bridge_directory_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "focus.conference",
                                room = %self.room_jid,
                                skipped,
                                "Lagged behind bridge events"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.bridge_events_closed = true;
                        }
                    }
                }
            }

            if self.state == Lifecycle::Stopped {
                break;
            }
        }

        info!(
            target: "focus.conference",
            room = %self.room_jid,
            "Conference actor stopped"
        );
    }

    async fn handle_message(&mut self, message: ConferenceMessage) {
        match message {
            ConferenceMessage::Start { respond_to } => {
                let result = self.handle_start().await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::Stop { respond_to } => {
                self.stop("requested").await;
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(());
                }
            }
            ConferenceMessage::AddSource {
                endpoint,
                sources,
                respond_to,
            } => {
                let result = self.handle_add_source(&endpoint, sources).await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::RemoveSource {
                endpoint,
                sources,
                respond_to,
            } => {
                let result = self.handle_remove_source(&endpoint, &sources).await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::AcceptSession {
                endpoint,
                sources,
                transport,
                initial_last_n,
                respond_to,
            } => {
                let result = self
                    .handle_accept_session(&endpoint, sources, transport, initial_last_n)
                    .await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::TerminateSession {
                endpoint,
                bridge_session_id,
                reinvite,
                respond_to,
            } => {
                let result = self
                    .handle_terminate_session(&endpoint, &bridge_session_id, reinvite)
                    .await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::IceFailed {
                endpoint,
                bridge_session_id,
            } => {
                self.handle_ice_failed(&endpoint, &bridge_session_id).await;
            }
            ConferenceMessage::MuteRequest {
                muter,
                target,
                kind,
                mute,
                respond_to,
            } => {
                let result = self.handle_mute_request(&muter, &target, kind, mute).await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::MuteAll {
                kind,
                actor,
                respond_to,
            } => {
                let result = self.handle_mute_all(kind, &actor).await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::MoveEndpoints {
                endpoints,
                respond_to,
            } => {
                let moved = self.handle_move_endpoints(&endpoints).await;
                let _ = respond_to.send(moved);
            }
            ConferenceMessage::MoveBridgeEndpoints {
                bridge,
                count,
                respond_to,
            } => {
                let moved = self.handle_move_bridge(&bridge, count).await;
                let _ = respond_to.send(moved);
            }
            ConferenceMessage::RedirectVisitor {
                visitor_requested,
                respond_to,
            } => {
                let node = self.handle_redirect_visitor(visitor_requested).await;
                let _ = respond_to.send(node);
            }
            ConferenceMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            ConferenceMessage::MemberResolved {
                presence,
                features,
                visitor_node,
            } => {
                self.handle_member_resolved(presence, features, visitor_node);
            }
            ConferenceMessage::InviteFinished {
                endpoint,
                runner,
                outcome,
            } => {
                self.handle_invite_finished(&endpoint, &runner, outcome).await;
            }
            ConferenceMessage::Timer(kind) => self.handle_timer(kind).await,
            ConferenceMessage::BridgeSession(event) => {
                self.handle_bridge_session_event(event).await;
            }
            ConferenceMessage::VisitorRoomJoined { node, result } => {
                self.handle_visitor_room_joined(node, result).await;
            }
            ConferenceMessage::VisitorRoom { node, event } => {
                self.handle_visitor_room_event(&node, event).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    async fn handle_start(&mut self) -> Result<(), FocusError> {
        if self.state != Lifecycle::Created {
            return Err(FocusError::AlreadyStarted);
        }
        self.state = Lifecycle::Joining;

        if let Err(e) = self.room.join().await {
            let error = FocusError::Transport(e.to_string());
            self.stop("room join failed").await;
            return Err(error);
        }

        let meeting_id = self.room.meeting_id().unwrap_or_else(MeetingId::random);
        if !self.registry.claim_meeting_id(&meeting_id, &self.room_jid) {
            self.stop("meeting id collision").await;
            return Err(FocusError::MeetingIdCollision(meeting_id));
        }
        info!(
            target: "focus.conference",
            room = %self.room_jid,
            meeting_id = %meeting_id,
            "Conference joined its room"
        );

        let sink = self.self_sender.clone();
        self.sessions = Some(Arc::new(BridgeSessionManager::new(
            self.room_jid.clone(),
            meeting_id.clone(),
            Arc::clone(&self.services.bridge_directory),
            Arc::clone(&self.services.provisioner),
            Box::new(move |event| {
                // mailbox full means the conference is badly behind;
                // dropping a bridge event is preferable to blocking the
                // manager's caller
                let _ = sink.try_send(ConferenceMessage::BridgeSession(event));
            }),
        )));
        self.meeting_id = Some(meeting_id);

        self.properties.set(properties::SUPPORTS_SESSION_RESTART, true);
        self.properties.set(
            properties::VISITORS_ENABLED,
            self.room
                .visitors_enabled()
                .unwrap_or(self.services.config.visitors_enabled),
        );
        self.properties.set(properties::BRIDGE_COUNT, 0);
        self.properties.set(properties::AUDIO_LIMIT_REACHED, false);
        self.properties.set(properties::VIDEO_LIMIT_REACHED, false);
        self.publish_properties().await;

        self.state = Lifecycle::Running;
        self.arm_start_timeout();

        for presence in self.room.members() {
            self.member_joined(presence).await;
        }

        Ok(())
    }

    async fn stop(&mut self, reason: &str) {
        if self.state == Lifecycle::Stopped {
            return;
        }
        info!(
            target: "focus.conference",
            room = %self.room_jid,
            participants = self.participants.len(),
            reason,
            "Stopping conference"
        );
        self.state = Lifecycle::Stopped;

        self.start_timeout = None;
        self.single_timeout = None;
        self.reconnect_timeout = None;
        self.flush_timers.clear();

        let participants: Vec<EndpointId> = self.participants.keys().cloned().collect();
        for endpoint in &participants {
            if let Some(p) = self.participants.get_mut(endpoint) {
                p.cancel_invite();
                if p.session.bridge_session_id().is_some() {
                    let _ = self
                        .services
                        .signaling
                        .terminate_session(&p.jid, TerminateReason::Gone, false)
                        .await;
                }
            }
        }
        gauge!("focus_participants").decrement(to_f64(self.participants.len()));
        self.participants.clear();

        if let Some(sessions) = &self.sessions {
            sessions.expire().await;
        }

        for (_, visitor_room) in self.visitor_rooms.drain() {
            if let VisitorRoomState::Joined(room) = &visitor_room.state {
                room.leave().await;
            }
            let _ = self
                .services
                .visitors
                .disconnect(&visitor_room.node.name, &self.room_jid)
                .await;
        }

        self.room.leave().await;
        if let Some(meeting_id) = self.meeting_id.take() {
            self.registry.release_meeting_id(&meeting_id, &self.room_jid);
        }
        self.registry.conference_ended(&self.room_jid);
        self.cancel_token.cancel();
    }

    fn ensure_running(&self) -> Result<(), FocusError> {
        if self.state == Lifecycle::Running {
            Ok(())
        } else {
            Err(FocusError::NotStarted)
        }
    }

    // ------------------------------------------------------------------
    // membership
    // ------------------------------------------------------------------

    async fn handle_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::MemberJoined(presence) => self.member_joined(presence).await,
            RoomEvent::MemberLeft { presence } => self.member_left(presence, false).await,
            RoomEvent::MemberKicked { presence } => self.member_left(presence, true).await,
            RoomEvent::RoomDestroyed { reason } => {
                debug!(
                    target: "focus.conference",
                    room = %self.room_jid,
                    reason = reason.as_deref().unwrap_or(""),
                    "Room destroyed"
                );
                self.stop("room destroyed").await;
            }
            RoomEvent::LocalRoleChanged(role) => {
                if role != Role::Owner {
                    self.stop("focus demoted below owner").await;
                }
            }
            RoomEvent::MeetingIdSet(id) => {
                if self.meeting_id.as_ref() != Some(&id) && self.state == Lifecycle::Running {
                    warn!(
                        target: "focus.conference",
                        room = %self.room_jid,
                        meeting_id = %id,
                        "Ignoring meeting id change after start"
                    );
                }
            }
            RoomEvent::AudioSendersChanged(count) => {
                self.update_limit_property(MediaKind::Audio, count).await;
            }
            RoomEvent::VideoSendersChanged(count) => {
                self.update_limit_property(MediaKind::Video, count).await;
            }
            RoomEvent::StartMutedChanged { audio, video } => {
                self.start_muted = MutedKinds { audio, video };
            }
            RoomEvent::TranscribingChanged { url } => {
                if let Some(sessions) = &self.sessions {
                    sessions.set_transcriber_url(url).await;
                }
            }
            RoomEvent::AvModerationChanged { kind, enabled } => {
                self.av_moderation.set(kind, enabled);
            }
            RoomEvent::SignalingLost { resumable } => {
                if resumable {
                    if self.reconnect_timeout.is_none() {
                        self.reconnect_timeout = Some(ScheduledTimeout::schedule(
                            self.services.config.reconnect_timeout,
                            self.self_sender.clone(),
                            ConferenceMessage::Timer(TimerKind::Reconnect),
                        ));
                    }
                } else {
                    self.stop("signaling lost").await;
                }
            }
            RoomEvent::SignalingRestored => {
                self.reconnect_timeout = None;
            }
        }
    }

    async fn member_joined(&mut self, presence: MemberPresence) {
        if self.state != Lifecycle::Running {
            return;
        }
        let endpoint = presence.nickname.clone();
        debug!(
            target: "focus.conference",
            room = %self.room_jid,
            endpoint = %endpoint,
            role = ?presence.role,
            "Member joined"
        );

        if let Some(p) = self.participants.get_mut(&endpoint) {
            p.desktop_muted = presence.desktop_muted;
        }
        self.members.insert(endpoint, presence);

        self.update_recording_property().await;
        self.update_member_timers();
        self.sweep_invites();
    }

    async fn member_left(&mut self, presence: MemberPresence, kicked: bool) {
        let endpoint = presence.nickname.clone();
        if self.members.remove(&endpoint).is_none() {
            return;
        }
        debug!(
            target: "focus.conference",
            room = %self.room_jid,
            endpoint = %endpoint,
            kicked,
            "Member left"
        );

        self.terminate_participant(&endpoint, TerminateReason::Gone, true, false)
            .await;
        self.update_recording_property().await;

        if self.total_member_count() == 0 {
            let switching = presence.is_switching_to_breakout();
            if switching || self.registry.has_breakouts(&self.room_jid) {
                // the room empties toward a breakout: linger and re-check
                // when the start timeout fires
                self.arm_start_timeout();
                self.single_timeout = None;
            } else {
                self.stop("last member left").await;
            }
        } else {
            self.update_member_timers();
        }
    }

    /// Launch feature discovery for every uninvited member once the
    /// conference is big enough.
    fn sweep_invites(&mut self) {
        if self.state != Lifecycle::Running {
            return;
        }
        if self.total_member_count() < self.services.config.min_participants {
            return;
        }

        let mut to_discover: Vec<(MemberPresence, Option<String>)> = Vec::new();
        for presence in self.members.values() {
            if !self.participants.contains_key(&presence.nickname)
                && !self.pending_discovery.contains(&presence.nickname)
            {
                to_discover.push((presence.clone(), None));
            }
        }
        for (node, visitor_room) in &self.visitor_rooms {
            for presence in visitor_room.members.values() {
                if !self.participants.contains_key(&presence.nickname)
                    && !self.pending_discovery.contains(&presence.nickname)
                {
                    to_discover.push((presence.clone(), Some(node.clone())));
                }
            }
        }

        for (presence, visitor_node) in to_discover {
            self.start_discovery(presence, visitor_node);
        }
    }

    /// Feature discovery may block on a disco round-trip, so it runs on
    /// the I/O pool and reports back through the mailbox.
    fn start_discovery(&mut self, presence: MemberPresence, visitor_node: Option<String>) {
        self.pending_discovery.insert(presence.nickname.clone());
        let transport = Arc::clone(&self.services.transport);
        let sender = self.self_sender.clone();
        self.services.io_pool.spawn(async move {
            let features = transport
                .discover_features(&presence.jid, presence.caps_hash.as_deref())
                .await;
            let _ = sender
                .send(ConferenceMessage::MemberResolved {
                    presence,
                    features,
                    visitor_node,
                })
                .await;
        });
    }

    fn handle_member_resolved(
        &mut self,
        presence: MemberPresence,
        features: common::features::FeatureSet,
        visitor_node: Option<String>,
    ) {
        let endpoint = presence.nickname.clone();
        self.pending_discovery.remove(&endpoint);

        if self.state != Lifecycle::Running || self.participants.contains_key(&endpoint) {
            return;
        }
        let still_present = match &visitor_node {
            None => self.members.contains_key(&endpoint),
            Some(node) => self
                .visitor_rooms
                .get(node)
                .is_some_and(|vr| vr.members.contains_key(&endpoint)),
        };
        if !still_present {
            debug!(
                target: "focus.conference",
                room = %self.room_jid,
                endpoint = %endpoint,
                "Member gone before discovery finished"
            );
            return;
        }

        let mut participant = Participant::new(
            endpoint.clone(),
            presence.jid.clone(),
            features,
            presence.role,
        );
        participant.stats_id = presence.stats_id.clone();
        participant.region = presence.region.clone();
        participant.visitor = visitor_node.is_some() || presence.role == Role::Visitor;
        participant.trusted_component = presence.is_component();
        participant.desktop_muted = presence.desktop_muted;

        self.participants.insert(endpoint.clone(), participant);
        gauge!("focus_participants").increment(1.0);
        info!(
            target: "focus.conference",
            room = %self.room_jid,
            endpoint = %endpoint,
            participants = self.participants.len(),
            "Participant created"
        );

        self.invite_participant(&endpoint, false);
    }

    // ------------------------------------------------------------------
    // invitations
    // ------------------------------------------------------------------

    /// Launch an invite runner for the participant. `reinvite` drives a
    /// transport-replace instead of a fresh session-initiate.
    fn invite_participant(&mut self, endpoint: &EndpointId, reinvite: bool) {
        let Some(sessions) = self.sessions.clone() else {
            return;
        };
        let policy = self.av_moderation.combined_with(self.start_muted);
        let version_pin = self.registry.pinned_version(&self.room_jid);

        let Some(participant) = self.participants.get_mut(endpoint) else {
            return;
        };
        let force_muted = force_mute_on_invite(
            policy,
            participant.role,
            participant.trusted_component,
            &participant.features,
        );

        let cancel = Arc::new(AtomicBool::new(false));
        participant.set_invite(Arc::clone(&cancel));

        let runner = InviteRunner {
            endpoint: participant.endpoint.clone(),
            jid: participant.jid.clone(),
            features: participant.features.clone(),
            stats_id: participant.stats_id.clone(),
            region: if participant.region.is_empty() {
                self.services.config.region.clone()
            } else {
                participant.region.clone()
            },
            visitor: participant.visitor,
            reinvite,
            force_muted,
            use_private_addresses: self.services.config.use_private_addresses,
            version_pin,
            cancel,
            sessions,
            sources: Arc::clone(&self.sources),
            signaling: Arc::clone(&self.services.signaling),
            mailbox: self.self_sender.clone(),
        };
        self.services.io_pool.spawn(runner.run());
    }

    async fn handle_invite_finished(
        &mut self,
        endpoint: &EndpointId,
        runner: &Arc<AtomicBool>,
        outcome: InviteOutcome,
    ) {
        let Some(participant) = self.participants.get_mut(endpoint) else {
            return;
        };
        if !participant.is_current_invite(runner) {
            debug!(
                target: "focus.conference",
                room = %self.room_jid,
                endpoint = %endpoint,
                "Ignoring outcome of a superseded invite"
            );
            return;
        }

        match outcome {
            InviteOutcome::Canceled => {
                participant.clear_invite();
            }
            InviteOutcome::Sent {
                bridge_session_id,
                mut initial,
            } => {
                participant.clear_invite();
                participant.session = SessionState::Offered { bridge_session_id };

                // bridge feedback sources are not conference sources;
                // they never get removed and stay out of the tracker
                initial.remove(&EndpointId::new(FEEDBACK_OWNER));
                participant.queue.reset(initial);
                let current = filter_for_receiver(
                    &participant.features,
                    self.sources.snapshot_excluding(endpoint),
                );
                participant.queue.reconcile(&current);
            }
            InviteOutcome::Failed { error } => {
                participant.clear_invite();
                counter!("focus_invites_failed_total").increment(1);
                warn!(
                    target: "focus.conference",
                    room = %self.room_jid,
                    endpoint = %endpoint,
                    error = %error,
                    "Invite failed, terminating participant"
                );
                self.terminate_participant(endpoint, TerminateReason::GeneralError, true, false)
                    .await;
            }
        }
    }

    /// Destroy a participant record: cancel its invite, tear down its
    /// session, drop its sources (propagated unless suppressed) and its
    /// bridge channels.
    async fn terminate_participant(
        &mut self,
        endpoint: &EndpointId,
        reason: TerminateReason,
        send_terminate: bool,
        suppress_source_signaling: bool,
    ) {
        let Some(mut participant) = self.participants.remove(endpoint) else {
            return;
        };
        participant.cancel_invite();
        self.flush_timers.remove(endpoint);
        gauge!("focus_participants").decrement(1.0);

        if send_terminate && participant.session.bridge_session_id().is_some() {
            if let Err(e) = self
                .services
                .signaling
                .terminate_session(&participant.jid, reason, false)
                .await
            {
                debug!(
                    target: "focus.conference",
                    room = %self.room_jid,
                    endpoint = %endpoint,
                    error = %e,
                    "Session terminate failed"
                );
            }
        }

        let removed = self.sources.remove(endpoint);
        if !removed.is_empty() && !suppress_source_signaling {
            self.propagate_removal(endpoint, &removed).await;
        }
        if suppress_source_signaling {
            for other in self.participants.values_mut() {
                other.queue.forget(endpoint);
            }
        }

        if let Some(sessions) = &self.sessions {
            sessions.remove_participant(endpoint).await;
        }
        self.refresh_limit_properties().await;

        info!(
            target: "focus.conference",
            room = %self.room_jid,
            endpoint = %endpoint,
            participants = self.participants.len(),
            "Participant terminated"
        );
    }

    // ------------------------------------------------------------------
    // sources
    // ------------------------------------------------------------------

    async fn handle_add_source(
        &mut self,
        endpoint: &EndpointId,
        proposed: EndpointSources,
    ) -> Result<EndpointSources, FocusError> {
        self.ensure_running()?;
        if !self.participants.contains_key(endpoint) {
            return Err(FocusError::ParticipantNotFound(endpoint.clone()));
        }

        self.check_sender_limits(endpoint, &proposed)?;
        let accepted = self.sources.try_to_add(endpoint, proposed)?;

        if !accepted.is_empty() {
            self.propagate_addition(endpoint, &accepted).await;
            self.refresh_limit_properties().await;
        }
        Ok(accepted)
    }

    async fn handle_remove_source(
        &mut self,
        endpoint: &EndpointId,
        requested: &EndpointSources,
    ) -> Result<EndpointSources, FocusError> {
        self.ensure_running()?;
        if !self.participants.contains_key(endpoint) {
            return Err(FocusError::ParticipantNotFound(endpoint.clone()));
        }

        let removed = self.sources.try_to_remove(endpoint, requested)?;
        if !removed.is_empty() {
            self.propagate_removal(endpoint, &removed).await;
            self.refresh_limit_properties().await;
        }
        Ok(removed)
    }

    /// Reject source additions that would create a new sender above the
    /// room's per-kind limit.
    fn check_sender_limits(
        &self,
        endpoint: &EndpointId,
        proposed: &EndpointSources,
    ) -> Result<(), FocusError> {
        let checks = [
            (MediaKind::Audio, self.services.config.max_audio_senders),
            (MediaKind::Video, self.services.config.max_video_senders),
        ];
        for (kind, limit) in checks {
            let Some(limit) = limit else { continue };
            if proposed.has_kind(kind)
                && !self.sources.endpoint_has_kind(endpoint, kind)
                && self.sender_count(kind) >= limit
            {
                return Err(FocusError::SenderLimitExceeded(kind));
            }
        }
        Ok(())
    }

    /// Current sender count for a kind. The room's presence-derived count
    /// is authoritative for what the MUC observes; the registry covers
    /// senders whose sources arrived before their presence update.
    fn sender_count(&self, kind: MediaKind) -> usize {
        let room_count = match kind.bridge_kind() {
            MediaKind::Audio => self.room.audio_senders_count(),
            _ => self.room.video_senders_count(),
        };
        self.sources.sender_count(kind).max(room_count)
    }

    async fn propagate_addition(&mut self, owner: &EndpointId, added: &EndpointSources) {
        let receivers: Vec<EndpointId> = self
            .participants
            .keys()
            .filter(|e| *e != owner)
            .cloned()
            .collect();
        for receiver in receivers {
            if let Some(p) = self.participants.get_mut(&receiver) {
                p.queue.add(owner, added.clone());
            }
            self.schedule_flush(&receiver).await;
        }
    }

    async fn propagate_removal(&mut self, owner: &EndpointId, removed: &EndpointSources) {
        let receivers: Vec<EndpointId> = self
            .participants
            .keys()
            .filter(|e| *e != owner)
            .cloned()
            .collect();
        for receiver in receivers {
            if let Some(p) = self.participants.get_mut(&receiver) {
                p.queue.remove(owner, removed);
            }
            self.schedule_flush(&receiver).await;
        }
    }

    /// Flush a participant's queue now, or arm the coalescing timer. A
    /// peer without an accepted session keeps its deltas queued.
    async fn schedule_flush(&mut self, endpoint: &EndpointId) {
        let Some(participant) = self.participants.get(endpoint) else {
            return;
        };
        if !matches!(participant.session, SessionState::Active { .. })
            || !participant.queue.has_pending()
        {
            return;
        }
        if self.flush_timers.contains_key(endpoint) {
            return;
        }

        let delay = self
            .services
            .config
            .source_signaling_delay(self.participants.len());
        if delay.is_zero() {
            self.flush_sources(endpoint).await;
        } else {
            self.flush_timers.insert(
                endpoint.clone(),
                ScheduledTimeout::schedule(
                    delay,
                    self.self_sender.clone(),
                    ConferenceMessage::Timer(TimerKind::SourceSignaling(endpoint.clone())),
                ),
            );
        }
    }

    /// Emit the pending deltas: removes first, then adds.
    async fn flush_sources(&mut self, endpoint: &EndpointId) {
        let Some(participant) = self.participants.get_mut(endpoint) else {
            return;
        };
        let update = participant.queue.flush();
        let jid = participant.jid.clone();

        if !update.remove.is_empty() {
            if let Err(e) = self.services.signaling.source_remove(&jid, update.remove).await {
                warn!(
                    target: "focus.sources",
                    room = %self.room_jid,
                    endpoint = %endpoint,
                    error = %e,
                    "source-remove failed"
                );
            }
        }
        if !update.add.is_empty() {
            if let Err(e) = self.services.signaling.source_add(&jid, update.add).await {
                warn!(
                    target: "focus.sources",
                    room = %self.room_jid,
                    endpoint = %endpoint,
                    error = %e,
                    "source-add failed"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // sessions
    // ------------------------------------------------------------------

    async fn handle_accept_session(
        &mut self,
        endpoint: &EndpointId,
        proposed: EndpointSources,
        transport: Option<crate::xmpp::jingle::IceTransport>,
        initial_last_n: Option<u32>,
    ) -> Result<(), FocusError> {
        self.ensure_running()?;
        let Some(participant) = self.participants.get(endpoint) else {
            return Err(FocusError::ParticipantNotFound(endpoint.clone()));
        };
        if matches!(participant.session, SessionState::None) {
            return Err(FocusError::InvalidBridgeSession);
        }

        let accepted = if proposed.is_empty() {
            EndpointSources::default()
        } else {
            self.check_sender_limits(endpoint, &proposed)?;
            self.sources.try_to_add(endpoint, proposed)?
        };

        let Some(sessions) = self.sessions.clone() else {
            return Err(FocusError::NotStarted);
        };
        let Some(bridge_session_id) = sessions.bridge_session_id(endpoint) else {
            return Err(FocusError::InvalidBridgeSession);
        };

        if let Some(participant) = self.participants.get_mut(endpoint) {
            participant.session = SessionState::Active { bridge_session_id };
        }

        let own_sources = self.sources.snapshot().remove(endpoint);
        sessions
            .update_participant(
                endpoint,
                EndpointUpdate {
                    transport,
                    sources: own_sources,
                    initial_last_n,
                    expire_after_seconds: None,
                },
            )
            .await;

        // the accepted session precedes any queued source delivery
        self.flush_sources(endpoint).await;

        if !accepted.is_empty() {
            self.propagate_addition(endpoint, &accepted).await;
            self.refresh_limit_properties().await;
        }
        Ok(())
    }

    async fn handle_terminate_session(
        &mut self,
        endpoint: &EndpointId,
        bridge_session_id: &str,
        reinvite: bool,
    ) -> Result<(), FocusError> {
        self.ensure_running()?;
        let Some(participant) = self.participants.get_mut(endpoint) else {
            return Err(FocusError::ParticipantNotFound(endpoint.clone()));
        };
        if participant.session.bridge_session_id() != Some(bridge_session_id) {
            return Err(FocusError::InvalidBridgeSession);
        }
        if reinvite && !participant.restart_limit.accept() {
            return Err(FocusError::NotAllowed(
                "session restart rate limit exceeded".to_string(),
            ));
        }

        participant.cancel_invite();
        participant.session = SessionState::None;

        let removed = self.sources.remove(endpoint);
        if !removed.is_empty() {
            self.propagate_removal(endpoint, &removed).await;
            self.refresh_limit_properties().await;
        }
        if let Some(sessions) = &self.sessions {
            sessions.remove_participant(endpoint).await;
        }

        if reinvite {
            self.invite_participant(endpoint, false);
        }
        Ok(())
    }

    async fn handle_ice_failed(&mut self, endpoint: &EndpointId, bridge_session_id: &str) {
        let Some(participant) = self.participants.get(endpoint) else {
            return;
        };
        if participant.session.bridge_session_id() != Some(bridge_session_id) {
            debug!(
                target: "focus.conference",
                room = %self.room_jid,
                endpoint = %endpoint,
                "ICE failure for a stale session, ignored"
            );
            return;
        }
        info!(
            target: "focus.conference",
            room = %self.room_jid,
            endpoint = %endpoint,
            "ICE failed, restarting endpoint"
        );

        if let Some(sessions) = &self.sessions {
            sessions.remove_participant(endpoint).await;
        }
        if let Some(p) = self.participants.get_mut(endpoint) {
            p.session = SessionState::None;
        }
        self.invite_participant(endpoint, false);
    }

    // ------------------------------------------------------------------
    // mute policy
    // ------------------------------------------------------------------

    /// Role of a member, from the participant table, the mirrored member
    /// list, or the room itself for occupants whose presence has not
    /// reached the coordinator yet.
    fn member_role(&self, endpoint: &EndpointId) -> Option<Role> {
        self.participants
            .get(endpoint)
            .map(|p| p.role)
            .or_else(|| self.members.get(endpoint).map(|m| m.role))
            .or_else(|| {
                self.room
                    .member(&self.room_jid.occupant(endpoint.as_str()))
                    .map(|m| m.role)
            })
    }

    async fn handle_mute_request(
        &mut self,
        muter: &EndpointId,
        target: &EndpointId,
        kind: MediaKind,
        mute: bool,
    ) -> MuteResult {
        let Some(muter_role) = self.member_role(muter) else {
            return MuteResult::NotAllowed;
        };
        let Some(target_p) = self.participants.get(target) else {
            return MuteResult::Error;
        };

        let jid = target_p.jid.clone();
        let allowed = check_mute_request(
            muter_role,
            muter == target,
            mute,
            target_p.trusted_component,
            &target_p.features,
            || self.room.is_member_allowed_to_unmute(&jid, kind),
        );
        if allowed.is_err() {
            return MuteResult::NotAllowed;
        }

        if let Some(sessions) = &self.sessions {
            sessions.mute(std::slice::from_ref(target), mute, kind).await;
        }
        if self
            .services
            .signaling
            .request_mute(&jid, kind, mute)
            .await
            .is_err()
        {
            return MuteResult::Error;
        }

        if kind == MediaKind::Desktop {
            if let Some(p) = self.participants.get_mut(target) {
                p.desktop_muted = mute;
            }
        }
        MuteResult::Success
    }

    async fn handle_mute_all(&mut self, kind: MediaKind, actor: &EndpointId) -> MuteResult {
        if !self.member_role(actor).is_some_and(Role::has_moderator_rights) {
            return MuteResult::NotAllowed;
        }

        let targets: Vec<(EndpointId, common::types::FullJid)> = self
            .participants
            .values()
            .filter(|p| {
                p.endpoint != *actor
                    && may_force_mute(p.role, p.trusted_component, &p.features)
            })
            .map(|p| (p.endpoint.clone(), p.jid.clone()))
            .collect();
        if targets.is_empty() {
            return MuteResult::Success;
        }

        let endpoints: Vec<EndpointId> = targets.iter().map(|(e, _)| e.clone()).collect();
        if let Some(sessions) = &self.sessions {
            sessions.mute(&endpoints, true, kind).await;
        }
        for (_, jid) in &targets {
            let _ = self.services.signaling.request_mute(jid, kind, true).await;
        }
        MuteResult::Success
    }

    // ------------------------------------------------------------------
    // endpoint moves and bridge failures
    // ------------------------------------------------------------------

    async fn handle_move_endpoints(&mut self, endpoints: &[EndpointId]) -> usize {
        let mut moved = 0;
        for endpoint in endpoints {
            if !self.participants.contains_key(endpoint) {
                continue;
            }
            if let Some(sessions) = &self.sessions {
                if sessions.bridge_of(endpoint).is_none() {
                    continue;
                }
                sessions.remove_participant(endpoint).await;
            }
            self.invite_participant(endpoint, true);
            moved += 1;
        }
        if moved > 0 {
            counter!("focus_participants_moved_total").increment(to_u64(moved));
        }
        moved
    }

    async fn handle_move_bridge(&mut self, bridge: &BridgeId, count: Option<usize>) -> usize {
        let Some(sessions) = &self.sessions else {
            return 0;
        };
        let mut endpoints = sessions.participants_on(bridge);
        if let Some(count) = count {
            endpoints.truncate(count);
        }
        self.handle_move_endpoints(&endpoints).await
    }

    fn handle_bridge_directory_event(&mut self, event: BridgeEvent) {
        let bridge = match event {
            BridgeEvent::Added(_) => return,
            BridgeEvent::Removed(b)
            | BridgeEvent::ShuttingDown(b)
            | BridgeEvent::FailedHealthCheck(b) => b,
        };
        let Some(sessions) = &self.sessions else {
            return;
        };
        if sessions.bridges().contains(&bridge) {
            // the removal and the resulting re-invites flow back through
            // the mailbox as a BridgeRemoved session event
            let _ = sessions.remove_bridge(&bridge);
        }
    }

    async fn handle_bridge_session_event(&mut self, event: BridgeSessionEvent) {
        match event {
            BridgeSessionEvent::CountChanged(count) => {
                if self.properties.set(properties::BRIDGE_COUNT, count) {
                    self.publish_properties().await;
                }
            }
            BridgeSessionEvent::SelectionFailed => {
                if self.properties.set(properties::BRIDGE_SELECTION_FAILED, true) {
                    self.publish_properties().await;
                }
            }
            BridgeSessionEvent::SelectionSucceeded => {
                if self.properties.unset(properties::BRIDGE_SELECTION_FAILED) {
                    self.publish_properties().await;
                }
            }
            BridgeSessionEvent::BridgeRemoved { bridge, endpoints } => {
                if endpoints.is_empty() {
                    return;
                }
                counter!("focus_participants_moved_total").increment(to_u64(endpoints.len()));
                info!(
                    target: "focus.conference",
                    room = %self.room_jid,
                    bridge = %bridge,
                    endpoints = endpoints.len(),
                    "Re-inviting endpoints of a removed bridge"
                );
                for endpoint in &endpoints {
                    if let Some(p) = self.participants.get_mut(endpoint) {
                        p.session = SessionState::None;
                    } else {
                        continue;
                    }
                    self.invite_participant(endpoint, true);
                }
            }
            BridgeSessionEvent::EndpointRemoved(endpoint) => {
                if let Some(p) = self.participants.get_mut(&endpoint) {
                    p.session = SessionState::None;
                } else {
                    return;
                }
                self.invite_participant(&endpoint, true);
            }
        }
    }

    // ------------------------------------------------------------------
    // visitors
    // ------------------------------------------------------------------

    async fn handle_redirect_visitor(&mut self, visitor_requested: bool) -> Option<String> {
        if self.state != Lifecycle::Running {
            return None;
        }
        let enabled = self
            .room
            .visitors_enabled()
            .unwrap_or(self.services.config.visitors_enabled);
        if !enabled || self.room.lobby_enabled() || self.main_room.is_some() {
            return None;
        }

        let soft_limit = self
            .room
            .participants_soft_limit()
            .unwrap_or(self.services.config.participants_soft_limit);
        let wanted = !self.visitor_rooms.is_empty()
            || visitor_requested
            || self.user_participant_count() >= soft_limit;
        if !wanted {
            return None;
        }

        let in_use: Vec<String> = self.visitor_rooms.keys().cloned().collect();
        let node = self
            .services
            .visitors
            .select(&self.room_jid, &in_use)
            .await?;

        if let Some(visitor_room) = self.visitor_rooms.get_mut(&node.name) {
            visitor_room.invited += 1;
            debug!(
                target: "focus.conference",
                room = %self.room_jid,
                node = %node.name,
                invited = visitor_room.invited,
                "Redirecting to a visitor node already in use"
            );
            return Some(node.name);
        }

        let Ok(mirror) = visitor_room_jid(&self.room_jid, &node) else {
            warn!(
                target: "focus.conference",
                room = %self.room_jid,
                node = %node.name,
                "Visitor node has an unusable muc domain"
            );
            return None;
        };

        let mut visitor_room = VisitorRoom::joining(node.clone());
        visitor_room.invited = 1;
        self.visitor_rooms.insert(node.name.clone(), visitor_room);

        // the join and router IQ happen off the actor loop
        let transport = Arc::clone(&self.services.transport);
        let visitors = Arc::clone(&self.services.visitors);
        let sender = self.self_sender.clone();
        let main_room = self.room_jid.clone();
        let node_name = node.name.clone();
        let forwarder_token = self.cancel_token.child_token();
        self.services.io_pool.spawn(async move {
            let result = async {
                let (vroom, events) = transport.find_or_create_room(&mirror).await?;
                vroom.join().await?;
                visitors.connect(&node_name, &main_room).await?;
                Ok::<_, crate::xmpp::room::TransportError>((vroom, events))
            }
            .await;

            match result {
                Ok((vroom, mut events)) => {
                    let event_sender = sender.clone();
                    let event_node = node_name.clone();
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                () = forwarder_token.cancelled() => break,
                                event = events.recv() => match event {
                                    Some(event) => {
                                        if event_sender
                                            .send(ConferenceMessage::VisitorRoom {
                                                node: event_node.clone(),
                                                event,
                                            })
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    None => break,
                                },
                            }
                        }
                    });
                    let _ = sender
                        .send(ConferenceMessage::VisitorRoomJoined {
                            node: node_name,
                            result: Ok(vroom),
                        })
                        .await;
                }
                Err(e) => {
                    let _ = sender
                        .send(ConferenceMessage::VisitorRoomJoined {
                            node: node_name,
                            result: Err(e),
                        })
                        .await;
                }
            }
        });

        self.update_visitor_properties().await;
        Some(node.name)
    }

    async fn handle_visitor_room_joined(
        &mut self,
        node: String,
        result: Result<Arc<dyn ChatRoom>, crate::xmpp::room::TransportError>,
    ) {
        match result {
            Ok(room) => {
                if let Some(visitor_room) = self.visitor_rooms.get_mut(&node) {
                    visitor_room.state = VisitorRoomState::Joined(room);
                    info!(
                        target: "focus.conference",
                        room = %self.room_jid,
                        node = %node,
                        "Visitor room joined"
                    );
                }
            }
            Err(e) => {
                warn!(
                    target: "focus.conference",
                    room = %self.room_jid,
                    node = %node,
                    error = %e,
                    "Visitor room join failed"
                );
                self.visitor_rooms.remove(&node);
            }
        }
        self.update_visitor_properties().await;
    }

    async fn handle_visitor_room_event(&mut self, node: &str, event: RoomEvent) {
        match event {
            RoomEvent::MemberJoined(presence) => {
                if let Some(visitor_room) = self.visitor_rooms.get_mut(node) {
                    visitor_room
                        .members
                        .insert(presence.nickname.clone(), presence);
                }
                self.update_visitor_properties().await;
                self.update_member_timers();
                self.sweep_invites();
            }
            RoomEvent::MemberLeft { presence } | RoomEvent::MemberKicked { presence } => {
                let endpoint = presence.nickname.clone();
                if let Some(visitor_room) = self.visitor_rooms.get_mut(node) {
                    visitor_room.members.remove(&endpoint);
                }
                self.terminate_participant(&endpoint, TerminateReason::Gone, true, false)
                    .await;
                self.update_visitor_properties().await;
                self.update_member_timers();
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // timers, counters, properties
    // ------------------------------------------------------------------

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ConferenceStart => {
                self.start_timeout = None;
                if self.total_member_count() > 0 {
                    return;
                }
                if self.registry.has_breakouts(&self.room_jid) {
                    self.arm_start_timeout();
                } else {
                    self.stop("conference start timeout").await;
                }
            }
            TimerKind::SingleParticipant => {
                self.single_timeout = None;
                if self.total_member_count() != 1 {
                    return;
                }
                let lone: Option<EndpointId> = self.participants.keys().next().cloned();
                if let Some(endpoint) = lone {
                    info!(
                        target: "focus.conference",
                        room = %self.room_jid,
                        endpoint = %endpoint,
                        "Single participant timed out"
                    );
                    // the peer learns about departures via presence; no
                    // source-remove is signaled
                    self.terminate_participant(&endpoint, TerminateReason::Expired, true, true)
                        .await;
                }
                if let Some(sessions) = &self.sessions {
                    sessions.expire().await;
                }
            }
            TimerKind::Reconnect => {
                self.reconnect_timeout = None;
                self.stop("signaling was not restored in time").await;
            }
            TimerKind::SourceSignaling(endpoint) => {
                self.flush_timers.remove(&endpoint);
                self.flush_sources(&endpoint).await;
            }
        }
    }

    fn arm_start_timeout(&mut self) {
        self.start_timeout = Some(ScheduledTimeout::schedule(
            self.services.config.conference_start_timeout,
            self.self_sender.clone(),
            ConferenceMessage::Timer(TimerKind::ConferenceStart),
        ));
    }

    fn update_member_timers(&mut self) {
        let total = self.total_member_count();
        if total == 0 {
            if self.start_timeout.is_none() {
                self.arm_start_timeout();
            }
        } else {
            self.start_timeout = None;
        }

        if total == 1 {
            if self.single_timeout.is_none() {
                self.single_timeout = Some(ScheduledTimeout::schedule(
                    self.services.config.single_participant_timeout,
                    self.self_sender.clone(),
                    ConferenceMessage::Timer(TimerKind::SingleParticipant),
                ));
            }
        } else {
            self.single_timeout = None;
        }
    }

    fn total_member_count(&self) -> usize {
        self.members.len()
            + self
                .visitor_rooms
                .values()
                .map(|vr| vr.members.len())
                .sum::<usize>()
    }

    /// Users in the main room: neither components nor visitors.
    fn user_participant_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| !m.is_component() && m.role != Role::Visitor)
            .count()
    }

    async fn update_limit_property(&mut self, kind: MediaKind, sender_count: usize) {
        let (key, limit) = match kind.bridge_kind() {
            MediaKind::Audio => (
                properties::AUDIO_LIMIT_REACHED,
                self.services.config.max_audio_senders,
            ),
            _ => (
                properties::VIDEO_LIMIT_REACHED,
                self.services.config.max_video_senders,
            ),
        };
        let reached = limit.is_some_and(|l| sender_count >= l);
        if self.properties.set(key, reached) {
            self.publish_properties().await;
        }
    }

    async fn refresh_limit_properties(&mut self) {
        let audio = self.sender_count(MediaKind::Audio);
        let video = self.sender_count(MediaKind::Video);
        self.update_limit_property(MediaKind::Audio, audio).await;
        self.update_limit_property(MediaKind::Video, video).await;
    }

    async fn update_recording_property(&mut self) {
        let recording = self.members.values().any(|m| m.is_recorder);
        if self
            .properties
            .set(properties::AUDIO_RECORDING_ENABLED, recording)
        {
            self.publish_properties().await;
        }
    }

    async fn update_visitor_properties(&mut self) {
        let visitor_count: usize = self
            .visitor_rooms
            .values()
            .map(|vr| vr.members.len())
            .sum();
        let mut changed = self.properties.set(properties::VISITOR_COUNT, visitor_count);
        if self.visitor_rooms.is_empty() {
            changed |= self.properties.unset(properties::VISITOR_CODECS);
        } else if !self.services.config.visitor_codecs.is_empty() {
            changed |= self.properties.set(
                properties::VISITOR_CODECS,
                self.services.config.visitor_codecs.clone(),
            );
        }
        if changed {
            self.publish_properties().await;
        }
    }

    async fn publish_properties(&self) {
        self.room
            .set_presence_extension(properties::PRESENCE_EXTENSION, self.properties.to_json())
            .await;
    }

    fn snapshot(&self) -> ConferenceSnapshot {
        let mut participants: Vec<_> =
            self.participants.values().map(Participant::summary).collect();
        participants.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        ConferenceSnapshot {
            room: self.room_jid.to_string(),
            meeting_id: self.meeting_id.as_ref().map(ToString::to_string),
            state: self.state.as_str().to_string(),
            participants,
            bridge_count: self.sessions.as_ref().map_or(0, |s| s.bridge_count()),
            properties: self.properties.as_map().clone(),
            visitor_count: self
                .visitor_rooms
                .values()
                .map(|vr| vr.members.len())
                .sum(),
            created_at: self.created_at,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(count: usize) -> f64 {
    count as f64
}

fn to_u64(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}
