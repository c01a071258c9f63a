//! Pre-wired test environments and presence fixtures.

use crate::mock_bridge::{MockBridgeDirectory, MockProvisioner};
use crate::mock_room::MockTransport;
use crate::mock_signaling::RecordingSignaling;
use crate::mock_visitors::MockVisitorDirectory;
use common::features::{Feature, FeatureSet};
use common::role::Role;
use common::types::{FullJid, RoomJid};
use conference_focus::conference::ConferenceOptions;
use conference_focus::registry::{FocusRegistry, FocusServices};
use conference_focus::tasks::IoPool;
use conference_focus::xmpp::presence::MemberPresence;
use conference_focus::FocusConfig;
use std::sync::Arc;

/// The room name used by `TestEnv` convenience helpers.
pub const TEST_MUC_DOMAIN: &str = "muc.example.com";

/// Install a subscriber honoring `RUST_LOG` for a test binary. Safe to
/// call from every test; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conference_focus=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// One bundle of mocks wired into a `FocusServices`.
pub struct TestEnv {
    pub config: FocusConfig,
    pub transport: Arc<MockTransport>,
    pub signaling: Arc<RecordingSignaling>,
    pub bridges: Arc<MockBridgeDirectory>,
    pub provisioner: Arc<MockProvisioner>,
    pub visitors: Arc<MockVisitorDirectory>,
}

impl TestEnv {
    /// Defaults: one healthy bridge, one visitor node, everyone gets the
    /// full audio+video+sctp feature set.
    #[must_use]
    pub fn new() -> Self {
        let transport = MockTransport::new();
        transport.set_default_features(av_features());
        Self {
            config: FocusConfig::default(),
            transport,
            signaling: RecordingSignaling::new(),
            bridges: MockBridgeDirectory::with_default_bridge(),
            provisioner: MockProvisioner::new(),
            visitors: MockVisitorDirectory::with_default_node(),
        }
    }

    /// Bundle the mocks; call after adjusting `config`.
    #[must_use]
    pub fn services(&self) -> Arc<FocusServices> {
        Arc::new(FocusServices {
            config: Arc::new(self.config.clone()),
            transport: self.transport.clone(),
            signaling: self.signaling.clone(),
            bridge_directory: self.bridges.clone(),
            provisioner: self.provisioner.clone(),
            visitors: self.visitors.clone(),
            io_pool: IoPool::new(self.config.io_pool_limit),
        })
    }

    #[must_use]
    pub fn registry(&self) -> Arc<FocusRegistry> {
        FocusRegistry::new(self.services())
    }

    /// Options for a top-level conference in the test domain.
    #[must_use]
    pub fn options(&self, room: &str) -> ConferenceOptions {
        ConferenceOptions {
            room: room_jid(room),
            main_room: None,
        }
    }

    /// Options for a breakout of `main`.
    #[must_use]
    pub fn breakout_options(&self, room: &str, main: &str) -> ConferenceOptions {
        ConferenceOptions {
            room: room_jid(room),
            main_room: Some(room_jid(main)),
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// `name@muc.example.com`.
///
/// # Panics
///
/// Panics on an invalid name; fixtures are for tests.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn room_jid(name: &str) -> RoomJid {
    match RoomJid::parse(&format!("{name}@{TEST_MUC_DOMAIN}")) {
        Ok(jid) => jid,
        Err(e) => unreachable!("invalid fixture room name {name}: {e}"),
    }
}

/// Occupant address of `nick` in the room.
#[must_use]
pub fn occupant(room: &RoomJid, nick: &str) -> FullJid {
    room.occupant(nick)
}

/// Presence of a plain member.
#[must_use]
pub fn presence(room: &RoomJid, nick: &str, role: Role) -> MemberPresence {
    MemberPresence::new(room.occupant(nick), role)
}

/// Audio + video + sctp, the typical endpoint.
#[must_use]
pub fn av_features() -> FeatureSet {
    FeatureSet::new([Feature::Audio, Feature::Video, Feature::Sctp])
}

/// A modern endpoint that also supports remote mute and multi-stream.
#[must_use]
pub fn full_features() -> FeatureSet {
    FeatureSet::new([
        Feature::Audio,
        Feature::Video,
        Feature::Sctp,
        Feature::AudioMute,
        Feature::SourceNames,
        Feature::ReceiveMultipleStreams,
        Feature::SsrcRewriting,
    ])
}
