//! The per-conference bridge-session manager.
//!
//! Maps endpoints to bridges and hides the wire protocol behind the
//! injected provisioner. Internally synchronized; events toward the
//! coordinator are emitted strictly after the internal lock is released.

use super::api::{
    AllocationError, BridgeDirectory, BridgeProvisioner, ColibriAllocation, EndpointUpdate,
    ParticipantAllocation, ProvisionError, SelectionRequest,
};
use common::media::MediaKind;
use common::types::{BridgeId, EndpointId, MeetingId, Region, RoomJid};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Events surfaced to the conference coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSessionEvent {
    /// The set of bridges in the conference changed size.
    CountChanged(usize),
    /// The selector produced no bridge for an allocation.
    SelectionFailed,
    /// The selector produced a bridge again after a failure.
    SelectionSucceeded,
    /// A bridge was removed together with the endpoints it carried; the
    /// coordinator re-invites them.
    BridgeRemoved {
        bridge: BridgeId,
        endpoints: Vec<EndpointId>,
    },
    /// A single endpoint vanished from its bridge; the coordinator
    /// re-invites it.
    EndpointRemoved(EndpointId),
}

/// Sink for session events, called without any internal lock held.
pub type EventSink = Box<dyn Fn(BridgeSessionEvent) + Send + Sync>;

struct BridgeEntry {
    session_id: String,
    region: Region,
    endpoints: HashSet<EndpointId>,
}

#[derive(Default)]
struct Inner {
    bridges: HashMap<BridgeId, BridgeEntry>,
    endpoint_bridge: HashMap<EndpointId, BridgeId>,
}

/// Client view of the conference's bridge sessions.
pub struct BridgeSessionManager {
    room: RoomJid,
    meeting_id: MeetingId,
    directory: Arc<dyn BridgeDirectory>,
    provisioner: Arc<dyn BridgeProvisioner>,
    inner: Mutex<Inner>,
    transcriber_url: Mutex<Option<String>>,
    events: EventSink,
}

impl BridgeSessionManager {
    #[must_use]
    pub fn new(
        room: RoomJid,
        meeting_id: MeetingId,
        directory: Arc<dyn BridgeDirectory>,
        provisioner: Arc<dyn BridgeProvisioner>,
        events: EventSink,
    ) -> Self {
        Self {
            room,
            meeting_id,
            directory,
            provisioner,
            inner: Mutex::new(Inner::default()),
            transcriber_url: Mutex::new(None),
            events,
        }
    }

    /// Select a bridge and allocate channels for one endpoint.
    pub async fn allocate(
        &self,
        request: &ParticipantAllocation,
        version_pin: Option<String>,
    ) -> Result<ColibriAllocation, AllocationError> {
        let conference_bridges: Vec<BridgeId> =
            lock(&self.inner).bridges.keys().cloned().collect();

        let selection = SelectionRequest {
            participant_region: request.region.clone(),
            conference_bridges,
            version_pin,
            visitor: request.visitor,
        };
        let Some(descriptor) = self.directory.select(&selection).await else {
            warn!(
                target: "focus.bridge",
                room = %self.room,
                endpoint = %request.endpoint,
                "Bridge selection failed"
            );
            (self.events)(BridgeSessionEvent::SelectionFailed);
            return Err(AllocationError::NoBridgeAvailable);
        };
        (self.events)(BridgeSessionEvent::SelectionSucceeded);

        let mut allocation = self
            .provisioner
            .create_endpoint(&descriptor.id, &self.room, &self.meeting_id, request)
            .await
            .map_err(|e| match e {
                ProvisionError::ConferenceAlreadyExists => AllocationError::ConferenceAlreadyExists,
                other => AllocationError::Failed(other.to_string()),
            })?;

        let (count_changed, new_bridge) = {
            let mut inner = lock(&self.inner);

            // a re-allocation moves the endpoint off its previous bridge
            if let Some(previous) = inner.endpoint_bridge.remove(&request.endpoint) {
                if let Some(entry) = inner.bridges.get_mut(&previous) {
                    entry.endpoints.remove(&request.endpoint);
                }
            }

            let new_bridge = !inner.bridges.contains_key(&descriptor.id);
            let entry = inner
                .bridges
                .entry(descriptor.id.clone())
                .or_insert_with(|| BridgeEntry {
                    session_id: allocation.bridge_session_id.clone(),
                    region: allocation.region.clone(),
                    endpoints: HashSet::new(),
                });
            // the first allocation fixes the session id for the bridge
            allocation.bridge_session_id = entry.session_id.clone();
            entry.endpoints.insert(request.endpoint.clone());
            inner
                .endpoint_bridge
                .insert(request.endpoint.clone(), descriptor.id.clone());

            (new_bridge.then_some(inner.bridges.len()), new_bridge)
        };

        if let Some(count) = count_changed {
            info!(
                target: "focus.bridge",
                room = %self.room,
                bridge = %descriptor.id,
                bridge_count = count,
                "Bridge added to conference"
            );
            (self.events)(BridgeSessionEvent::CountChanged(count));
        }

        if new_bridge {
            let url = lock(&self.transcriber_url).clone();
            if let Some(url) = url {
                if let Err(e) = self
                    .provisioner
                    .set_transcriber_url(&descriptor.id, &self.room, Some(&url))
                    .await
                {
                    warn!(
                        target: "focus.bridge",
                        room = %self.room,
                        bridge = %descriptor.id,
                        error = %e,
                        "Failed to set transcriber url on new bridge"
                    );
                }
            }
        }

        Ok(allocation)
    }

    /// Fire-and-forget endpoint update. Errors are logged; a rejected
    /// update means the bridge lost the endpoint, which is surfaced as
    /// `EndpointRemoved` so the coordinator re-invites.
    pub async fn update_participant(&self, endpoint: &EndpointId, update: EndpointUpdate) {
        let Some(bridge) = lock(&self.inner).endpoint_bridge.get(endpoint).cloned() else {
            debug!(
                target: "focus.bridge",
                room = %self.room,
                endpoint = %endpoint,
                "Update for endpoint without a bridge session, dropped"
            );
            return;
        };

        match self
            .provisioner
            .update_endpoint(&bridge, &self.room, endpoint, &update)
            .await
        {
            Ok(()) => {}
            Err(ProvisionError::Rejected(reason)) => {
                warn!(
                    target: "focus.bridge",
                    room = %self.room,
                    endpoint = %endpoint,
                    bridge = %bridge,
                    reason = %reason,
                    "Bridge rejected endpoint update"
                );
                self.forget_endpoint(endpoint);
                (self.events)(BridgeSessionEvent::EndpointRemoved(endpoint.clone()));
            }
            Err(e) => {
                warn!(
                    target: "focus.bridge",
                    room = %self.room,
                    endpoint = %endpoint,
                    bridge = %bridge,
                    error = %e,
                    "Endpoint update failed"
                );
            }
        }
    }

    /// Bulk force-mute. Failures are logged; a bridge that fails the
    /// round-trip is treated as broken and removed, surfacing its
    /// endpoints via `BridgeRemoved`.
    pub async fn mute(&self, endpoints: &[EndpointId], muted: bool, kind: MediaKind) {
        let mut by_bridge: HashMap<BridgeId, Vec<EndpointId>> = HashMap::new();
        {
            let inner = lock(&self.inner);
            for endpoint in endpoints {
                if let Some(bridge) = inner.endpoint_bridge.get(endpoint) {
                    by_bridge
                        .entry(bridge.clone())
                        .or_default()
                        .push(endpoint.clone());
                }
            }
        }

        for (bridge, bridge_endpoints) in by_bridge {
            if let Err(e) = self
                .provisioner
                .force_mute(
                    &bridge,
                    &self.room,
                    &bridge_endpoints,
                    kind.bridge_kind(),
                    muted,
                )
                .await
            {
                warn!(
                    target: "focus.bridge",
                    room = %self.room,
                    bridge = %bridge,
                    error = %e,
                    "Force-mute failed, treating bridge as broken"
                );
                self.remove_bridge(&bridge);
            }
        }
    }

    /// Expire one endpoint's channels and drop its mapping.
    pub async fn remove_participant(&self, endpoint: &EndpointId) {
        let Some(bridge) = self.forget_endpoint(endpoint) else {
            return;
        };

        if let Err(e) = self
            .provisioner
            .expire_endpoint(&bridge, &self.room, endpoint)
            .await
        {
            debug!(
                target: "focus.bridge",
                room = %self.room,
                endpoint = %endpoint,
                error = %e,
                "Expiring endpoint failed"
            );
        }

        // tear the conference off a bridge that no longer carries anyone
        let empty = {
            let mut inner = lock(&self.inner);
            let drained = inner
                .bridges
                .get(&bridge)
                .is_some_and(|entry| entry.endpoints.is_empty());
            if drained {
                inner.bridges.remove(&bridge);
                Some(inner.bridges.len())
            } else {
                None
            }
        };
        if let Some(count) = empty {
            let _ = self
                .provisioner
                .expire_conference(&bridge, &self.room)
                .await;
            (self.events)(BridgeSessionEvent::CountChanged(count));
        }
    }

    /// Remove a bridge (it failed or is shutting down) and return the
    /// endpoints it carried. The authoritative move-counting path: calling
    /// it again for the same bridge finds no endpoints and is a no-op.
    pub fn remove_bridge(&self, bridge: &BridgeId) -> Vec<EndpointId> {
        let removed = {
            let mut inner = lock(&self.inner);
            let Some(entry) = inner.bridges.remove(bridge) else {
                return Vec::new();
            };
            let mut endpoints: Vec<EndpointId> = entry.endpoints.into_iter().collect();
            endpoints.sort();
            for endpoint in &endpoints {
                inner.endpoint_bridge.remove(endpoint);
            }
            (endpoints, inner.bridges.len())
        };

        let (endpoints, count) = removed;
        counter!("focus_bridges_removed_total").increment(1);
        info!(
            target: "focus.bridge",
            room = %self.room,
            bridge = %bridge,
            endpoints = endpoints.len(),
            "Bridge removed from conference"
        );
        (self.events)(BridgeSessionEvent::CountChanged(count));
        (self.events)(BridgeSessionEvent::BridgeRemoved {
            bridge: bridge.clone(),
            endpoints: endpoints.clone(),
        });
        endpoints
    }

    /// Expire everything; used on conference stop. No events are emitted.
    pub async fn expire(&self) {
        let bridges: Vec<BridgeId> = {
            let mut inner = lock(&self.inner);
            inner.endpoint_bridge.clear();
            inner.bridges.drain().map(|(id, _)| id).collect()
        };
        for bridge in bridges {
            if let Err(e) = self.provisioner.expire_conference(&bridge, &self.room).await {
                debug!(
                    target: "focus.bridge",
                    room = %self.room,
                    bridge = %bridge,
                    error = %e,
                    "Expiring conference failed"
                );
            }
        }
    }

    /// Point the transcription pipeline of every current bridge at `url`.
    pub async fn set_transcriber_url(&self, url: Option<String>) {
        *lock(&self.transcriber_url) = url.clone();
        let bridges: Vec<BridgeId> = lock(&self.inner).bridges.keys().cloned().collect();
        for bridge in bridges {
            if let Err(e) = self
                .provisioner
                .set_transcriber_url(&bridge, &self.room, url.as_deref())
                .await
            {
                warn!(
                    target: "focus.bridge",
                    room = %self.room,
                    bridge = %bridge,
                    error = %e,
                    "Failed to update transcriber url"
                );
            }
        }
    }

    #[must_use]
    pub fn bridge_session_id(&self, endpoint: &EndpointId) -> Option<String> {
        let inner = lock(&self.inner);
        let bridge = inner.endpoint_bridge.get(endpoint)?;
        inner.bridges.get(bridge).map(|e| e.session_id.clone())
    }

    #[must_use]
    pub fn bridge_of(&self, endpoint: &EndpointId) -> Option<BridgeId> {
        lock(&self.inner).endpoint_bridge.get(endpoint).cloned()
    }

    #[must_use]
    pub fn bridge_count(&self) -> usize {
        lock(&self.inner).bridges.len()
    }

    #[must_use]
    pub fn bridges(&self) -> Vec<BridgeId> {
        lock(&self.inner).bridges.keys().cloned().collect()
    }

    #[must_use]
    pub fn bridge_regions(&self) -> Vec<Region> {
        lock(&self.inner)
            .bridges
            .values()
            .map(|e| e.region.clone())
            .collect()
    }

    #[must_use]
    pub fn participants_on(&self, bridge: &BridgeId) -> Vec<EndpointId> {
        lock(&self.inner)
            .bridges
            .get(bridge)
            .map(|e| {
                let mut endpoints: Vec<EndpointId> = e.endpoints.iter().cloned().collect();
                endpoints.sort();
                endpoints
            })
            .unwrap_or_default()
    }

    /// Drop the endpoint from the maps without wire traffic; returns its
    /// former bridge.
    fn forget_endpoint(&self, endpoint: &EndpointId) -> Option<BridgeId> {
        let mut inner = lock(&self.inner);
        let bridge = inner.endpoint_bridge.remove(endpoint)?;
        if let Some(entry) = inner.bridges.get_mut(&bridge) {
            entry.endpoints.remove(endpoint);
        }
        Some(bridge)
    }
}

/// The internal lock is never held across I/O or event emission; on a
/// poisoning panic elsewhere, keep serving the inner data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
