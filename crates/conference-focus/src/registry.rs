//! The process-wide conference registry.
//!
//! Directory from room identity to conference handle, the meeting-id
//! uniqueness table, and the bridge-version pin table consulted at
//! allocation time.

use crate::bridge::{BridgeDirectory, BridgeProvisioner};
use crate::conference::visitors::VisitorDirectory;
use crate::conference::{Conference, ConferenceHandle, ConferenceOptions, ConferenceSnapshot};
use crate::config::FocusConfig;
use crate::errors::FocusError;
use crate::tasks::IoPool;
use crate::xmpp::jingle::MediaSignaling;
use crate::xmpp::room::SignalingTransport;
use common::types::{MeetingId, RoomJid};
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Constructor-injected collaborators shared by every conference.
pub struct FocusServices {
    pub config: Arc<FocusConfig>,
    pub transport: Arc<dyn SignalingTransport>,
    pub signaling: Arc<dyn MediaSignaling>,
    pub bridge_directory: Arc<dyn BridgeDirectory>,
    pub provisioner: Arc<dyn BridgeProvisioner>,
    pub visitors: Arc<dyn VisitorDirectory>,
    pub io_pool: IoPool,
}

/// One pin table entry.
struct BridgePin {
    version: String,
    expires_at: Instant,
}

/// Pin table row for listings.
#[derive(Debug, Clone, Serialize)]
pub struct PinInfo {
    pub room: String,
    pub version: String,
    pub expires_in_seconds: u64,
}

struct Entry {
    handle: ConferenceHandle,
    main_room: Option<RoomJid>,
    /// Keeps the actor task observable; dropped (detached) with the entry.
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    conferences: HashMap<RoomJid, Entry>,
    meeting_ids: HashMap<MeetingId, RoomJid>,
    pins: HashMap<RoomJid, BridgePin>,
}

/// Directory of live conferences.
pub struct FocusRegistry {
    services: Arc<FocusServices>,
    inner: Mutex<Inner>,
}

impl FocusRegistry {
    #[must_use]
    pub fn new(services: Arc<FocusServices>) -> Arc<Self> {
        Arc::new(Self {
            services,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Find the live conference for the room, or create and start one.
    ///
    /// On a start failure (meeting-id collision, room join failure) the
    /// conference is removed again and the error returned.
    pub async fn conference_request(
        self: &Arc<Self>,
        options: ConferenceOptions,
    ) -> Result<ConferenceHandle, FocusError> {
        if let Some(handle) = self.get(&options.room) {
            if !handle.is_stopped() {
                return Ok(handle);
            }
        }

        let (room, room_events) = self
            .services
            .transport
            .find_or_create_room(&options.room)
            .await
            .map_err(|e| FocusError::Transport(e.to_string()))?;

        let (handle, task) = Conference::spawn(
            options.clone(),
            Arc::clone(&self.services),
            Arc::clone(self),
            room,
            room_events,
        );

        let count = {
            let mut inner = lock(&self.inner);
            inner.conferences.insert(
                options.room.clone(),
                Entry {
                    handle: handle.clone(),
                    main_room: options.main_room.clone(),
                    task,
                },
            );
            inner.conferences.len()
        };
        counter!("focus_conferences_created_total").increment(1);
        gauge!("focus_conferences").set(to_f64(count));
        info!(
            target: "focus.registry",
            room = %options.room,
            conferences = count,
            "Conference created"
        );

        match handle.start().await {
            Ok(()) => Ok(handle),
            Err(e) => {
                warn!(
                    target: "focus.registry",
                    room = %options.room,
                    error = %e,
                    "Conference failed to start"
                );
                self.conference_ended(&options.room);
                Err(e)
            }
        }
    }

    /// Claim a meeting identifier for a room. Returns false when another
    /// room already holds it.
    pub fn claim_meeting_id(&self, id: &MeetingId, room: &RoomJid) -> bool {
        let mut inner = lock(&self.inner);
        match inner.meeting_ids.get(id) {
            Some(holder) if holder != room => false,
            _ => {
                inner.meeting_ids.insert(id.clone(), room.clone());
                true
            }
        }
    }

    /// Release a meeting identifier, permitting reuse. Only the holding
    /// room may release; the conference calls this on stop.
    pub fn release_meeting_id(&self, id: &MeetingId, room: &RoomJid) {
        let mut inner = lock(&self.inner);
        if inner.meeting_ids.get(id) == Some(room) {
            inner.meeting_ids.remove(id);
        }
    }

    /// Drop a conference from the directory. Idempotent; called by the
    /// conference itself on stop, after it released its meeting id.
    pub fn conference_ended(&self, room: &RoomJid) {
        let count = {
            let mut inner = lock(&self.inner);
            inner.conferences.remove(room);
            inner.conferences.len()
        };
        gauge!("focus_conferences").set(to_f64(count));
    }

    #[must_use]
    pub fn get(&self, room: &RoomJid) -> Option<ConferenceHandle> {
        lock(&self.inner)
            .conferences
            .get(room)
            .map(|e| e.handle.clone())
    }

    /// Whether any live conference is a breakout of the given main room.
    #[must_use]
    pub fn has_breakouts(&self, main_room: &RoomJid) -> bool {
        lock(&self.inner)
            .conferences
            .values()
            .any(|e| e.main_room.as_ref() == Some(main_room))
    }

    #[must_use]
    pub fn conference_count(&self) -> usize {
        lock(&self.inner).conferences.len()
    }

    /// Pin the room's conference to a bridge version for a duration.
    pub fn pin(&self, room: RoomJid, version: String, duration: Duration) {
        let expires_at = Instant::now() + duration;
        lock(&self.inner).pins.insert(
            room,
            BridgePin {
                version,
                expires_at,
            },
        );
    }

    /// Remove a pin; returns true when one existed.
    pub fn unpin(&self, room: &RoomJid) -> bool {
        lock(&self.inner).pins.remove(room).is_some()
    }

    /// Unexpired pins; expired entries are dropped on the way.
    #[must_use]
    pub fn list_pins(&self) -> Vec<PinInfo> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        inner.pins.retain(|_, pin| pin.expires_at > now);
        let mut pins: Vec<PinInfo> = inner
            .pins
            .iter()
            .map(|(room, pin)| PinInfo {
                room: room.to_string(),
                version: pin.version.clone(),
                expires_in_seconds: pin.expires_at.saturating_duration_since(now).as_secs(),
            })
            .collect();
        pins.sort_by(|a, b| a.room.cmp(&b.room));
        pins
    }

    /// The version this room is pinned to, if the pin has not expired.
    #[must_use]
    pub fn pinned_version(&self, room: &RoomJid) -> Option<String> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        match inner.pins.get(room) {
            Some(pin) if pin.expires_at > now => Some(pin.version.clone()),
            Some(_) => {
                inner.pins.remove(room);
                None
            }
            None => None,
        }
    }

    /// Stop every conference; used on graceful shutdown.
    pub async fn stop_all(&self) {
        let handles: Vec<ConferenceHandle> = lock(&self.inner)
            .conferences
            .values()
            .map(|e| e.handle.clone())
            .collect();
        info!(
            target: "focus.registry",
            conferences = handles.len(),
            "Stopping all conferences"
        );
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Debug snapshot of every live conference.
    pub async fn snapshots(&self) -> Vec<ConferenceSnapshot> {
        let handles: Vec<ConferenceHandle> = lock(&self.inner)
            .conferences
            .values()
            .map(|e| e.handle.clone())
            .collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.room.cmp(&b.room));
        snapshots
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(count: usize) -> f64 {
    count as f64
}

/// The registry lock is only held for map bookkeeping, never across I/O.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use focus_test_utils::TestEnv;

    fn room(name: &str) -> RoomJid {
        RoomJid::parse(&format!("{name}@muc.example.com")).unwrap()
    }

    fn bare_registry() -> Arc<FocusRegistry> {
        TestEnv::new().registry()
    }

    #[test]
    fn test_meeting_id_uniqueness() {
        let registry = bare_registry();
        let id = MeetingId::new("meeting-1");

        assert!(registry.claim_meeting_id(&id, &room("a")));
        // re-claim by the holder is fine
        assert!(registry.claim_meeting_id(&id, &room("a")));
        // a second room is rejected
        assert!(!registry.claim_meeting_id(&id, &room("b")));

        // reuse is permitted after release
        registry.release_meeting_id(&id, &room("a"));
        assert!(registry.claim_meeting_id(&id, &room("b")));
    }

    #[test]
    fn test_release_requires_holder() {
        let registry = bare_registry();
        let id = MeetingId::new("meeting-1");
        assert!(registry.claim_meeting_id(&id, &room("a")));

        // a non-holder cannot release
        registry.release_meeting_id(&id, &room("b"));
        assert!(!registry.claim_meeting_id(&id, &room("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_table_expiry() {
        let registry = bare_registry();
        registry.pin(room("a"), "2.1".to_string(), Duration::from_secs(60));
        registry.pin(room("b"), "2.2".to_string(), Duration::from_secs(600));

        assert_eq!(registry.pinned_version(&room("a")).as_deref(), Some("2.1"));
        assert_eq!(registry.list_pins().len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(registry.pinned_version(&room("a")), None);
        let pins = registry.list_pins();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins.first().unwrap().version, "2.2");
    }

    #[test]
    fn test_unpin() {
        let registry = bare_registry();
        registry.pin(room("a"), "2.1".to_string(), Duration::from_secs(60));
        assert!(registry.unpin(&room("a")));
        assert!(!registry.unpin(&room("a")));
        assert!(registry.list_pins().is_empty());
    }
}
