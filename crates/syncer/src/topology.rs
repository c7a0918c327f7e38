//! Desired peer-set computation.

use std::collections::HashMap;

use capmesh_core::{PeerId, RegistryState};
use capmesh_network::StreamConfig;

/// Computes the full desired P2P peer set for a snapshot: the statically
/// configured peers plus every member of every public DON.
///
/// Statically configured entries keep their stream overrides; peers learned
/// from the registry get the default [`StreamConfig`].
pub fn desired_peer_set(
    state: &RegistryState,
    static_peers: &HashMap<PeerId, StreamConfig>,
) -> HashMap<PeerId, StreamConfig> {
    let mut peers = static_peers.clone();
    for don in state.dons().iter().filter(|d| d.is_public) {
        for member in &don.members {
            peers.entry(*member).or_default();
        }
    }
    peers
}
