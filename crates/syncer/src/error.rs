//! Reconciliation error types.
//!
//! Per-capability failures are typed values collected into the tick's
//! report; only snapshot-level failures abort a tick.

use capmesh_core::{CapabilityId, CapabilityType, CoreError, DonId, RegistryError};
use capmesh_network::NetworkError;
use thiserror::Error;

use crate::reader::ReadError;

/// Result alias used throughout the syncer crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// Tick- and lifecycle-level errors of the reconciliation engine.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to sync with remote registry: {0}")]
    Read(#[from] ReadError),

    #[error("registry syncer already started")]
    AlreadyStarted,

    #[error("registry syncer is not running")]
    NotStarted,

    #[error("failed to update peer connections: {0}")]
    PeerUpdate(#[from] NetworkError),
}

/// Per-capability shim setup failures. None of these abort the tick.
#[derive(Error, Debug)]
pub enum ShimError {
    #[error("no remote shim for capability type {0}; skipping")]
    UnsupportedCapabilityType(CapabilityType),

    #[error("capability {capability_id} referenced by don {don_id} is missing from the snapshot")]
    DanglingCapability {
        capability_id: CapabilityId,
        don_id: DonId,
    },

    #[error("local trigger {capability_id} not found after {attempts} discovery attempts")]
    DiscoveryExhausted {
        capability_id: CapabilityId,
        attempts: u32,
    },

    #[error("discovery cancelled by shutdown")]
    DiscoveryCancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("dispatcher bind failed: {0}")]
    Dispatcher(#[from] NetworkError),

    #[error("shim start failed: {0}")]
    Start(CoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
