//! Visitor-node overflow: the directory collaborator and per-conference
//! visitor room state.
//!
//! When a conference outgrows its soft limit (or a joiner asks for the
//! visitor role), new endpoints are redirected to an auxiliary signaling
//! node. The focus joins the node's mirror room to observe and invite the
//! visitors living there.

use crate::xmpp::presence::MemberPresence;
use crate::xmpp::room::{ChatRoom, TransportError};
use async_trait::async_trait;
use common::types::{AddressError, EndpointId, RoomJid};
use std::collections::HashMap;
use std::sync::Arc;

/// One auxiliary visitor node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorNode {
    /// Node name, used in redirects and the server-side router IQ.
    pub name: String,
    /// MUC domain hosting the node's mirror rooms.
    pub muc_domain: String,
}

/// The visitor-topology collaborator: which nodes exist, which to pick,
/// and the IQ endpoint wiring a node to a room.
#[async_trait]
pub trait VisitorDirectory: Send + Sync {
    /// Pick a node for the room. `in_use` names nodes this conference
    /// already redirected to; implementations usually prefer them.
    async fn select(&self, room: &RoomJid, in_use: &[String]) -> Option<VisitorNode>;

    /// Ask the server-side router to connect the node to the room.
    async fn connect(&self, node: &str, room: &RoomJid) -> Result<(), TransportError>;

    /// Disconnect the node when the conference ends.
    async fn disconnect(&self, node: &str, room: &RoomJid) -> Result<(), TransportError>;
}

/// The mirror room of this conference on one visitor node.
pub(crate) struct VisitorRoom {
    pub node: VisitorNode,
    pub state: VisitorRoomState,
    /// Redirects issued toward this node.
    pub invited: u64,
    /// Visitor members currently observed in the mirror room.
    pub members: HashMap<EndpointId, MemberPresence>,
}

pub(crate) enum VisitorRoomState {
    /// Join in flight on the I/O pool.
    Joining,
    Joined(Arc<dyn ChatRoom>),
}

impl VisitorRoom {
    pub(crate) fn joining(node: VisitorNode) -> Self {
        Self {
            node,
            state: VisitorRoomState::Joining,
            invited: 0,
            members: HashMap::new(),
        }
    }
}

/// Mirror-room address of a conference on a visitor node.
pub fn visitor_room_jid(main: &RoomJid, node: &VisitorNode) -> Result<RoomJid, AddressError> {
    RoomJid::parse(&format!("{}@{}", main.local(), node.muc_domain))
}
