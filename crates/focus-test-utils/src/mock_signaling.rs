//! Recording media-signaling mock.

use async_trait::async_trait;
use common::media::MediaKind;
use common::types::FullJid;
use conference_focus::sources::SourceMap;
use conference_focus::xmpp::jingle::{
    MediaSignaling, SessionOffer, SignalingError, TerminateReason,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Recorded {
    initiates: Vec<(FullJid, SessionOffer)>,
    replaces: Vec<(FullJid, SessionOffer)>,
    terminates: Vec<(FullJid, TerminateReason, bool)>,
    source_adds: Vec<(FullJid, SourceMap)>,
    source_removes: Vec<(FullJid, SourceMap)>,
    mutes: Vec<(FullJid, MediaKind, bool)>,
    /// Interleaved order of every signal, for ordering assertions.
    order: Vec<(FullJid, &'static str)>,
    /// Nicknames whose offers go unacknowledged.
    no_ack: HashSet<String>,
    /// Nicknames whose sends fail outright.
    fail: HashSet<String>,
}

/// Records every outbound signal; offers are acknowledged unless a
/// nickname is scripted otherwise.
pub struct RecordingSignaling {
    recorded: Mutex<Recorded>,
}

impl RecordingSignaling {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recorded: Mutex::new(Recorded::default()),
        })
    }

    /// Offers to this nickname will not be acknowledged.
    pub fn set_no_ack(&self, nickname: &str) {
        lock(&self.recorded).no_ack.insert(nickname.to_string());
    }

    /// Sends to this nickname fail.
    pub fn set_fail(&self, nickname: &str) {
        lock(&self.recorded).fail.insert(nickname.to_string());
    }

    /// Session-initiate offers sent to a nickname.
    #[must_use]
    pub fn initiates_to(&self, nickname: &str) -> Vec<SessionOffer> {
        lock(&self.recorded)
            .initiates
            .iter()
            .filter(|(jid, _)| jid.resource() == nickname)
            .map(|(_, offer)| offer.clone())
            .collect()
    }

    /// Transport-replace offers sent to a nickname.
    #[must_use]
    pub fn replaces_to(&self, nickname: &str) -> Vec<SessionOffer> {
        lock(&self.recorded)
            .replaces
            .iter()
            .filter(|(jid, _)| jid.resource() == nickname)
            .map(|(_, offer)| offer.clone())
            .collect()
    }

    /// Session-terminates sent to a nickname.
    #[must_use]
    pub fn terminates_to(&self, nickname: &str) -> Vec<(TerminateReason, bool)> {
        lock(&self.recorded)
            .terminates
            .iter()
            .filter(|(jid, _, _)| jid.resource() == nickname)
            .map(|(_, reason, restart)| (*reason, *restart))
            .collect()
    }

    /// Source-add batches delivered to a nickname.
    #[must_use]
    pub fn source_adds_to(&self, nickname: &str) -> Vec<SourceMap> {
        lock(&self.recorded)
            .source_adds
            .iter()
            .filter(|(jid, _)| jid.resource() == nickname)
            .map(|(_, map)| map.clone())
            .collect()
    }

    /// Source-remove batches delivered to a nickname.
    #[must_use]
    pub fn source_removes_to(&self, nickname: &str) -> Vec<SourceMap> {
        lock(&self.recorded)
            .source_removes
            .iter()
            .filter(|(jid, _)| jid.resource() == nickname)
            .map(|(_, map)| map.clone())
            .collect()
    }

    /// The kinds of signal sent to a nickname, in send order
    /// (`"initiate"`, `"replace"`, `"terminate"`, `"source-add"`,
    /// `"source-remove"`, `"mute"`).
    #[must_use]
    pub fn signal_order_to(&self, nickname: &str) -> Vec<&'static str> {
        lock(&self.recorded)
            .order
            .iter()
            .filter(|(jid, _)| jid.resource() == nickname)
            .map(|(_, kind)| *kind)
            .collect()
    }

    /// Mute directives sent to a nickname.
    #[must_use]
    pub fn mutes_to(&self, nickname: &str) -> Vec<(MediaKind, bool)> {
        lock(&self.recorded)
            .mutes
            .iter()
            .filter(|(jid, _, _)| jid.resource() == nickname)
            .map(|(_, kind, mute)| (*kind, *mute))
            .collect()
    }

    fn answer(&self, jid: &FullJid) -> Result<bool, SignalingError> {
        let recorded = lock(&self.recorded);
        if recorded.fail.contains(jid.resource()) {
            return Err(SignalingError::Send("scripted failure".to_string()));
        }
        Ok(!recorded.no_ack.contains(jid.resource()))
    }
}

#[async_trait]
impl MediaSignaling for RecordingSignaling {
    async fn initiate_session(
        &self,
        to: &FullJid,
        offer: SessionOffer,
    ) -> Result<bool, SignalingError> {
        let mut recorded = lock(&self.recorded);
        recorded.initiates.push((to.clone(), offer));
        recorded.order.push((to.clone(), "initiate"));
        drop(recorded);
        self.answer(to)
    }

    async fn replace_transport(
        &self,
        to: &FullJid,
        offer: SessionOffer,
    ) -> Result<bool, SignalingError> {
        let mut recorded = lock(&self.recorded);
        recorded.replaces.push((to.clone(), offer));
        recorded.order.push((to.clone(), "replace"));
        drop(recorded);
        self.answer(to)
    }

    async fn terminate_session(
        &self,
        to: &FullJid,
        reason: TerminateReason,
        allow_restart: bool,
    ) -> Result<(), SignalingError> {
        let mut recorded = lock(&self.recorded);
        recorded.terminates.push((to.clone(), reason, allow_restart));
        recorded.order.push((to.clone(), "terminate"));
        Ok(())
    }

    async fn source_add(&self, to: &FullJid, sources: SourceMap) -> Result<(), SignalingError> {
        let mut recorded = lock(&self.recorded);
        recorded.source_adds.push((to.clone(), sources));
        recorded.order.push((to.clone(), "source-add"));
        Ok(())
    }

    async fn source_remove(
        &self,
        to: &FullJid,
        sources: SourceMap,
    ) -> Result<(), SignalingError> {
        let mut recorded = lock(&self.recorded);
        recorded.source_removes.push((to.clone(), sources));
        recorded.order.push((to.clone(), "source-remove"));
        Ok(())
    }

    async fn request_mute(
        &self,
        to: &FullJid,
        kind: MediaKind,
        mute: bool,
    ) -> Result<(), SignalingError> {
        let mut recorded = lock(&self.recorded);
        recorded.mutes.push((to.clone(), kind, mute));
        recorded.order.push((to.clone(), "mute"));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
