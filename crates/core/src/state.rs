//! Point-in-time snapshots of the on-chain registry.

use std::collections::HashMap;

use crate::capability::{Capability, CapabilityId};
use crate::don::Don;
use crate::error::{CoreError, CoreResult};
use crate::peer_id::PeerId;

/// Size of a signer address in bytes.
pub const SIGNER_SIZE: usize = 20;

/// On-chain record of a node: its P2P identity and its signing address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub peer_id: PeerId,
    pub signer: [u8; SIGNER_SIZE],
}

/// An immutable snapshot of the registry contract's contents.
///
/// Produced fresh on every reconciliation tick and never mutated; the
/// previous and current snapshots may be held simultaneously for diffing.
#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    dons: Vec<Don>,
    capabilities: Vec<Capability>,
    nodes: Vec<NodeInfo>,
    capability_index: HashMap<CapabilityId, usize>,
    node_index: HashMap<PeerId, usize>,
}

impl RegistryState {
    /// Builds a snapshot and its lookup indexes.
    pub fn new(dons: Vec<Don>, capabilities: Vec<Capability>, nodes: Vec<NodeInfo>) -> Self {
        let capability_index = capabilities
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id(), i))
            .collect();
        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.peer_id, i))
            .collect();
        Self {
            dons,
            capabilities,
            nodes,
            capability_index,
            node_index,
        }
    }

    pub fn dons(&self) -> &[Don] {
        &self.dons
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Looks up a capability by its derived identity.
    pub fn capability(&self, id: &CapabilityId) -> Option<&Capability> {
        self.capability_index.get(id).map(|i| &self.capabilities[*i])
    }

    /// Looks up a node record by peer identity.
    pub fn node(&self, peer: &PeerId) -> Option<&NodeInfo> {
        self.node_index.get(peer).map(|i| &self.nodes[*i])
    }

    /// Resolves the signer addresses for every member of a DON.
    ///
    /// Fails if any member has no node record in this snapshot.
    pub fn signers_for(&self, don: &Don) -> CoreResult<Vec<[u8; SIGNER_SIZE]>> {
        don.members
            .iter()
            .map(|peer| {
                self.node(peer)
                    .map(|n| n.signer)
                    .ok_or(CoreError::UnknownNode(*peer))
            })
            .collect()
    }
}
