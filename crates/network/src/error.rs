//! Network-layer error types.

use capmesh_core::{CapabilityId, DonId, PeerId};
use thiserror::Error;

/// Result alias used throughout the network crate.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors produced by the dispatcher, the peer surface, and the shims.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("receiver already bound for capability {capability_id} on don {don_id}")]
    ReceiverExists {
        capability_id: CapabilityId,
        don_id: DonId,
    },

    #[error("failed to send to peer {peer}: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    #[error("failed to update peer connections: {0}")]
    ConnectionUpdate(String),

    #[error("quorum not reached: {got} matching signed responses, need {need}")]
    QuorumNotReached { got: usize, need: usize },

    #[error("message codec failure: {0}")]
    Codec(String),

    #[error("message length {len} exceeds maximum {max}")]
    MessageTooLarge { len: usize, max: usize },
}
