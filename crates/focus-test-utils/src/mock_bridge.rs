//! Mock bridge directory and provisioner.

use async_trait::async_trait;
use common::media::{EndpointSources, MediaKind};
use common::types::{BridgeId, EndpointId, MeetingId, Region, RoomJid};
use conference_focus::bridge::api::SelectionRequest;
use conference_focus::bridge::{
    BridgeDescriptor, BridgeDirectory, BridgeEvent, BridgeProvisioner, ColibriAllocation,
    EndpointUpdate, ParticipantAllocation, ProvisionError,
};
use conference_focus::xmpp::jingle::IceTransport;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const BRIDGE_EVENT_BUFFER: usize = 32;

/// Scriptable bridge-selection directory.
pub struct MockBridgeDirectory {
    bridges: Mutex<Vec<BridgeDescriptor>>,
    events: broadcast::Sender<BridgeEvent>,
    fail_selection: AtomicBool,
}

impl MockBridgeDirectory {
    /// Directory with a single healthy bridge.
    #[must_use]
    pub fn with_default_bridge() -> Arc<Self> {
        Self::with_bridges(vec![BridgeDescriptor {
            id: BridgeId::new("jvb1@bridges.example.com"),
            region: Region::new("test-region"),
            version: None,
        }])
    }

    #[must_use]
    pub fn with_bridges(bridges: Vec<BridgeDescriptor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(BRIDGE_EVENT_BUFFER);
        Arc::new(Self {
            bridges: Mutex::new(bridges),
            events,
            fail_selection: AtomicBool::new(false),
        })
    }

    pub fn add_bridge(&self, descriptor: BridgeDescriptor) {
        lock(&self.bridges).push(descriptor);
    }

    /// Drop a bridge from the selectable set and emit the given event.
    pub fn fail_bridge(&self, bridge: &BridgeId, event: BridgeEvent) {
        lock(&self.bridges).retain(|b| b.id != *bridge);
        let _ = self.events.send(event);
    }

    pub fn set_fail_selection(&self, fail: bool) {
        self.fail_selection.store(fail, Ordering::SeqCst);
    }

    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl BridgeDirectory for MockBridgeDirectory {
    async fn select(&self, request: &SelectionRequest) -> Option<BridgeDescriptor> {
        if self.fail_selection.load(Ordering::SeqCst) {
            return None;
        }
        let bridges = lock(&self.bridges);
        let eligible = |b: &&BridgeDescriptor| match &request.version_pin {
            Some(pin) => b.version.as_ref() == Some(pin),
            None => true,
        };
        bridges
            .iter()
            .filter(eligible)
            .find(|b| request.conference_bridges.contains(&b.id))
            .or_else(|| bridges.iter().find(eligible))
            .cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}

/// One recorded provisioner call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCall {
    Create {
        bridge: BridgeId,
        endpoint: EndpointId,
    },
    Update {
        bridge: BridgeId,
        endpoint: EndpointId,
    },
    ExpireEndpoint {
        bridge: BridgeId,
        endpoint: EndpointId,
    },
    ExpireConference {
        bridge: BridgeId,
    },
    ForceMute {
        bridge: BridgeId,
        endpoints: Vec<EndpointId>,
        kind: MediaKind,
        muted: bool,
    },
    Transcriber {
        bridge: BridgeId,
        url: Option<String>,
    },
}

#[derive(Default)]
struct ProvisionerState {
    session_ids: HashMap<(BridgeId, RoomJid), String>,
    fail_create: HashSet<BridgeId>,
    fail_mute: HashSet<BridgeId>,
    reject_update: HashSet<EndpointId>,
    feedback_sources: EndpointSources,
}

/// Records every wire call and answers allocations with stable session
/// ids per (bridge, room).
pub struct MockProvisioner {
    state: Mutex<ProvisionerState>,
    calls: Mutex<Vec<ProvisionCall>>,
}

impl MockProvisioner {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProvisionerState::default()),
            calls: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ProvisionCall> {
        lock(&self.calls).clone()
    }

    #[must_use]
    pub fn create_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, ProvisionCall::Create { .. }))
            .count()
    }

    pub fn set_fail_create(&self, bridge: BridgeId) {
        lock(&self.state).fail_create.insert(bridge);
    }

    pub fn set_fail_mute(&self, bridge: BridgeId) {
        lock(&self.state).fail_mute.insert(bridge);
    }

    pub fn set_reject_update(&self, endpoint: EndpointId) {
        lock(&self.state).reject_update.insert(endpoint);
    }

    pub fn set_feedback_sources(&self, sources: EndpointSources) {
        lock(&self.state).feedback_sources = sources;
    }

    /// The bridge session id handed out for a room, if any endpoint was
    /// allocated. Handy for terminate/ice tests that must echo it.
    #[must_use]
    pub fn session_id_for(&self, room: &RoomJid) -> Option<String> {
        lock(&self.state)
            .session_ids
            .iter()
            .find(|((_, r), _)| r == room)
            .map(|(_, id)| id.clone())
    }

    fn record(&self, call: ProvisionCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl BridgeProvisioner for MockProvisioner {
    async fn create_endpoint(
        &self,
        bridge: &BridgeId,
        room: &RoomJid,
        _meeting_id: &MeetingId,
        request: &ParticipantAllocation,
    ) -> Result<ColibriAllocation, ProvisionError> {
        self.record(ProvisionCall::Create {
            bridge: bridge.clone(),
            endpoint: request.endpoint.clone(),
        });

        let mut state = lock(&self.state);
        if state.fail_create.contains(bridge) {
            return Err(ProvisionError::BridgeUnresponsive);
        }
        let session_id = state
            .session_ids
            .entry((bridge.clone(), room.clone()))
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        Ok(ColibriAllocation {
            bridge: bridge.clone(),
            bridge_session_id: session_id,
            region: Region::new("test-region"),
            transport: IceTransport {
                ufrag: format!("ufrag-{}", request.endpoint),
                pwd: "mock-password".to_string(),
                fingerprint: "AA:BB:CC".to_string(),
                candidates: Vec::new(),
                rtcp_mux: true,
            },
            sctp_port: request.use_sctp.then_some(5000),
            feedback_sources: state.feedback_sources.clone(),
        })
    }

    async fn update_endpoint(
        &self,
        bridge: &BridgeId,
        _room: &RoomJid,
        endpoint: &EndpointId,
        _update: &EndpointUpdate,
    ) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::Update {
            bridge: bridge.clone(),
            endpoint: endpoint.clone(),
        });
        if lock(&self.state).reject_update.contains(endpoint) {
            return Err(ProvisionError::Rejected("unknown endpoint".to_string()));
        }
        Ok(())
    }

    async fn expire_endpoint(
        &self,
        bridge: &BridgeId,
        _room: &RoomJid,
        endpoint: &EndpointId,
    ) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::ExpireEndpoint {
            bridge: bridge.clone(),
            endpoint: endpoint.clone(),
        });
        Ok(())
    }

    async fn expire_conference(
        &self,
        bridge: &BridgeId,
        _room: &RoomJid,
    ) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::ExpireConference {
            bridge: bridge.clone(),
        });
        Ok(())
    }

    async fn force_mute(
        &self,
        bridge: &BridgeId,
        _room: &RoomJid,
        endpoints: &[EndpointId],
        kind: MediaKind,
        muted: bool,
    ) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::ForceMute {
            bridge: bridge.clone(),
            endpoints: endpoints.to_vec(),
            kind,
            muted,
        });
        if lock(&self.state).fail_mute.contains(bridge) {
            return Err(ProvisionError::BridgeUnresponsive);
        }
        Ok(())
    }

    async fn set_transcriber_url(
        &self,
        bridge: &BridgeId,
        _room: &RoomJid,
        url: Option<&str>,
    ) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::Transcriber {
            bridge: bridge.clone(),
            url: url.map(ToString::to_string),
        });
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
