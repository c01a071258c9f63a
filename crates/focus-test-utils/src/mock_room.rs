//! Mock chat-room transport: scriptable rooms with event injection.

use async_trait::async_trait;
use common::features::FeatureSet;
use common::media::MediaKind;
use common::types::{EndpointId, FullJid, MeetingId, RoomJid};
use conference_focus::xmpp::presence::MemberPresence;
use conference_focus::xmpp::room::{ChatRoom, RoomEvent, SignalingTransport, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const ROOM_EVENT_BUFFER: usize = 64;

#[derive(Default)]
struct RoomState {
    joined: bool,
    left: bool,
    members: HashMap<EndpointId, MemberPresence>,
    meeting_id: Option<MeetingId>,
    audio_senders: usize,
    video_senders: usize,
    lobby: bool,
    visitors_enabled: Option<bool>,
    soft_limit: Option<usize>,
    /// Nicknames allowed to unmute, per kind; `None` allows everyone.
    unmute_whitelist: Option<HashMap<MediaKind, Vec<String>>>,
    join_error: Option<String>,
}

/// A scriptable room. Tests drive membership with `member_joins` /
/// `member_leaves` (which update the member list *and* emit the event)
/// and read back what the focus published with `extension`.
pub struct MockRoom {
    jid: RoomJid,
    events: mpsc::Sender<RoomEvent>,
    state: Mutex<RoomState>,
    extensions: Mutex<HashMap<String, serde_json::Value>>,
}

impl MockRoom {
    fn new(jid: RoomJid, events: mpsc::Sender<RoomEvent>) -> Arc<Self> {
        Arc::new(Self {
            jid,
            events,
            state: Mutex::new(RoomState::default()),
            extensions: Mutex::new(HashMap::new()),
        })
    }

    /// Inject a raw event without touching the member list.
    pub async fn inject(&self, event: RoomEvent) {
        let _ = self.events.send(event).await;
    }

    /// Seed a member before the focus joins (visible via `members()`, no
    /// event emitted).
    pub fn seed_member(&self, presence: MemberPresence) {
        lock(&self.state)
            .members
            .insert(presence.nickname.clone(), presence);
    }

    /// A member joins: updates the list and emits the event.
    pub async fn member_joins(&self, presence: MemberPresence) {
        self.seed_member(presence.clone());
        self.inject(RoomEvent::MemberJoined(presence)).await;
    }

    /// A member leaves, optionally with a presence status (e.g.
    /// `switch_room`).
    pub async fn member_leaves(&self, nickname: &str, status: Option<&str>) {
        let endpoint = EndpointId::new(nickname);
        let presence = lock(&self.state).members.remove(&endpoint);
        if let Some(mut presence) = presence {
            presence.status = status.map(ToString::to_string);
            self.inject(RoomEvent::MemberLeft { presence }).await;
        }
    }

    /// A member is kicked.
    pub async fn member_kicked(&self, nickname: &str) {
        let endpoint = EndpointId::new(nickname);
        let presence = lock(&self.state).members.remove(&endpoint);
        if let Some(presence) = presence {
            self.inject(RoomEvent::MemberKicked { presence }).await;
        }
    }

    pub fn set_meeting_id(&self, id: MeetingId) {
        lock(&self.state).meeting_id = Some(id);
    }

    pub fn set_visitors_enabled(&self, enabled: Option<bool>) {
        lock(&self.state).visitors_enabled = enabled;
    }

    pub fn set_participants_soft_limit(&self, limit: Option<usize>) {
        lock(&self.state).soft_limit = limit;
    }

    pub fn set_lobby_enabled(&self, enabled: bool) {
        lock(&self.state).lobby = enabled;
    }

    pub fn set_sender_counts(&self, audio: usize, video: usize) {
        let mut state = lock(&self.state);
        state.audio_senders = audio;
        state.video_senders = video;
    }

    /// Restrict unmute to the given nicknames for a kind. Without a call,
    /// everyone may unmute.
    pub fn set_unmute_whitelist(&self, kind: MediaKind, nicknames: &[&str]) {
        let mut state = lock(&self.state);
        state
            .unmute_whitelist
            .get_or_insert_with(HashMap::new)
            .insert(kind, nicknames.iter().map(ToString::to_string).collect());
    }

    /// Make the next `join` fail.
    pub fn fail_join(&self, reason: &str) {
        lock(&self.state).join_error = Some(reason.to_string());
    }

    #[must_use]
    pub fn joined(&self) -> bool {
        lock(&self.state).joined
    }

    #[must_use]
    pub fn left(&self) -> bool {
        lock(&self.state).left
    }

    /// The last payload published under a presence extension name.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<serde_json::Value> {
        match self.extensions.lock() {
            Ok(map) => map.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    /// Convenience accessor for one conference property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<String> {
        self.extension(conference_focus::conference::properties::PRESENCE_EXTENSION)
            .and_then(|v| v.get(key).and_then(|p| p.as_str().map(ToString::to_string)))
    }
}

#[async_trait]
impl ChatRoom for MockRoom {
    fn jid(&self) -> &RoomJid {
        &self.jid
    }

    async fn join(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.join_error.take() {
            return Err(TransportError::Join(reason));
        }
        state.joined = true;
        Ok(())
    }

    async fn leave(&self) {
        let mut state = lock(&self.state);
        state.joined = false;
        state.left = true;
    }

    fn members(&self) -> Vec<MemberPresence> {
        lock(&self.state).members.values().cloned().collect()
    }

    fn member(&self, jid: &FullJid) -> Option<MemberPresence> {
        lock(&self.state)
            .members
            .values()
            .find(|m| m.jid == *jid)
            .cloned()
    }

    fn meeting_id(&self) -> Option<MeetingId> {
        lock(&self.state).meeting_id.clone()
    }

    async fn set_presence_extension(&self, name: &str, payload: serde_json::Value) {
        match self.extensions.lock() {
            Ok(mut map) => {
                map.insert(name.to_string(), payload);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name.to_string(), payload);
            }
        }
    }

    fn audio_senders_count(&self) -> usize {
        lock(&self.state).audio_senders
    }

    fn video_senders_count(&self) -> usize {
        lock(&self.state).video_senders
    }

    fn is_member_allowed_to_unmute(&self, jid: &FullJid, kind: MediaKind) -> bool {
        let state = lock(&self.state);
        match &state.unmute_whitelist {
            None => true,
            Some(map) => map
                .get(&kind.bridge_kind())
                .or_else(|| map.get(&kind))
                .is_none_or(|allowed| allowed.iter().any(|n| n == jid.resource())),
        }
    }

    fn lobby_enabled(&self) -> bool {
        lock(&self.state).lobby
    }

    fn visitors_enabled(&self) -> Option<bool> {
        lock(&self.state).visitors_enabled
    }

    fn participants_soft_limit(&self) -> Option<usize> {
        lock(&self.state).soft_limit
    }
}

/// The transport mock: hands out [`MockRoom`]s and answers feature
/// discovery from a scripted table.
pub struct MockTransport {
    rooms: Mutex<HashMap<RoomJid, Arc<MockRoom>>>,
    features: Mutex<HashMap<FullJid, FeatureSet>>,
    default_features: Mutex<FeatureSet>,
    scripted_meeting_ids: Mutex<HashMap<RoomJid, MeetingId>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            features: Mutex::new(HashMap::new()),
            default_features: Mutex::new(FeatureSet::assumed()),
            scripted_meeting_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Rooms created later for this jid will carry the given meeting id.
    pub fn script_meeting_id(&self, jid: RoomJid, id: MeetingId) {
        lock(&self.scripted_meeting_ids).insert(jid, id);
    }

    /// The room created for a jid, if the focus asked for it.
    #[must_use]
    pub fn room(&self, jid: &RoomJid) -> Option<Arc<MockRoom>> {
        lock(&self.rooms).get(jid).cloned()
    }

    /// Script the discovery answer for one occupant.
    pub fn set_features(&self, jid: FullJid, features: FeatureSet) {
        lock(&self.features).insert(jid, features);
    }

    /// Discovery answer for occupants without a scripted entry.
    pub fn set_default_features(&self, features: FeatureSet) {
        *lock(&self.default_features) = features;
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn find_or_create_room(
        &self,
        jid: &RoomJid,
    ) -> Result<(Arc<dyn ChatRoom>, mpsc::Receiver<RoomEvent>), TransportError> {
        let (sender, receiver) = mpsc::channel(ROOM_EVENT_BUFFER);
        let room = MockRoom::new(jid.clone(), sender);
        if let Some(id) = lock(&self.scripted_meeting_ids).get(jid).cloned() {
            room.set_meeting_id(id);
        }
        lock(&self.rooms).insert(jid.clone(), Arc::clone(&room));
        Ok((room, receiver))
    }

    async fn discover_features(&self, jid: &FullJid, _caps_hash: Option<&str>) -> FeatureSet {
        lock(&self.features)
            .get(jid)
            .cloned()
            .unwrap_or_else(|| lock(&self.default_features).clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
