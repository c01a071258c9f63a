//! Mock visitor-node directory.

use async_trait::async_trait;
use common::types::RoomJid;
use conference_focus::conference::visitors::{VisitorDirectory, VisitorNode};
use conference_focus::xmpp::room::TransportError;
use std::sync::{Arc, Mutex, MutexGuard};

/// Scriptable visitor topology: a fixed node list, in-use nodes
/// preferred, and every router IQ recorded.
pub struct MockVisitorDirectory {
    nodes: Mutex<Vec<VisitorNode>>,
    connects: Mutex<Vec<(String, RoomJid)>>,
    disconnects: Mutex<Vec<(String, RoomJid)>>,
}

impl MockVisitorDirectory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_nodes(Vec::new())
    }

    #[must_use]
    pub fn with_nodes(nodes: Vec<VisitorNode>) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            connects: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    /// A single node `v1` on `muc.v1.example.com`.
    #[must_use]
    pub fn with_default_node() -> Arc<Self> {
        Self::with_nodes(vec![VisitorNode {
            name: "v1".to_string(),
            muc_domain: "muc.v1.example.com".to_string(),
        }])
    }

    #[must_use]
    pub fn connects(&self) -> Vec<(String, RoomJid)> {
        lock(&self.connects).clone()
    }

    #[must_use]
    pub fn disconnects(&self) -> Vec<(String, RoomJid)> {
        lock(&self.disconnects).clone()
    }
}

#[async_trait]
impl VisitorDirectory for MockVisitorDirectory {
    async fn select(&self, _room: &RoomJid, in_use: &[String]) -> Option<VisitorNode> {
        let nodes = lock(&self.nodes);
        nodes
            .iter()
            .find(|n| in_use.contains(&n.name))
            .or_else(|| nodes.first())
            .cloned()
    }

    async fn connect(&self, node: &str, room: &RoomJid) -> Result<(), TransportError> {
        lock(&self.connects).push((node.to_string(), room.clone()));
        Ok(())
    }

    async fn disconnect(&self, node: &str, room: &RoomJid) -> Result<(), TransportError> {
        lock(&self.disconnects).push((node.to_string(), room.clone()));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
