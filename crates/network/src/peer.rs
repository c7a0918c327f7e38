//! Peer connection surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use capmesh_core::PeerId;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::NetworkResult;
use crate::stream::StreamConfig;

/// The node's handle onto the P2P transport.
#[async_trait]
pub trait Peer: Send + Sync {
    /// This node's own identity.
    fn id(&self) -> PeerId;

    /// Replaces the connection set: peers absent from `peers` are
    /// disconnected, peers present are (re)configured. Idempotent.
    async fn update_connections(
        &self,
        peers: HashMap<PeerId, StreamConfig>,
    ) -> NetworkResult<()>;
}

/// Provider of the node's [`Peer`] handle.
pub trait PeerWrapper: Send + Sync {
    fn get_peer(&self) -> Arc<dyn Peer>;
}

/// In-process [`Peer`] used by tests and dev-mode wiring: tracks the desired
/// connection set without opening transport streams.
pub struct InProcessPeer {
    id: PeerId,
    connections: RwLock<HashMap<PeerId, StreamConfig>>,
}

impl InProcessPeer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// The peers currently held in the connection set.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

#[async_trait]
impl Peer for InProcessPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    async fn update_connections(
        &self,
        peers: HashMap<PeerId, StreamConfig>,
    ) -> NetworkResult<()> {
        let mut connections = self.connections.write();
        let dropped = connections
            .keys()
            .filter(|p| !peers.contains_key(*p))
            .count();
        let added = peers
            .keys()
            .filter(|p| !connections.contains_key(*p))
            .count();
        debug!(
            total = peers.len(),
            added, dropped, "replacing peer connection set"
        );
        *connections = peers;
        Ok(())
    }
}

/// [`PeerWrapper`] over an [`InProcessPeer`].
pub struct InProcessPeerWrapper {
    peer: Arc<InProcessPeer>,
}

impl InProcessPeerWrapper {
    pub fn new(id: PeerId) -> Self {
        Self {
            peer: Arc::new(InProcessPeer::new(id)),
        }
    }

    /// Direct access to the underlying peer, for inspection.
    pub fn peer(&self) -> Arc<InProcessPeer> {
        self.peer.clone()
    }
}

impl PeerWrapper for InProcessPeerWrapper {
    fn get_peer(&self) -> Arc<dyn Peer> {
        self.peer.clone()
    }
}
