//! # Capmesh: Registry-Driven Capability Network Node
//!
//! Capmesh keeps a decentralized-oracle-network node in sync with its
//! on-chain capability registry. The node periodically snapshots the
//! registry, classifies its role relative to every DON, maintains the P2P
//! peer set, and installs the client- or server-side shims that carry
//! remote capability traffic.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use capmesh::prelude::*;
//!
//! # async fn run(reader: Arc<dyn StateReader>,
//! #              registry: Arc<dyn CapabilityRegistry>,
//! #              dispatcher: Arc<dyn Dispatcher>,
//! #              peers: Arc<dyn PeerWrapper>,
//! #              bootstrap: BootstrapSetup) -> Result<(), SyncError> {
//! let syncer = RegistrySyncer::new(
//!     reader,
//!     registry,
//!     dispatcher,
//!     peers,
//!     SyncerConfig::default(),
//!     bootstrap,
//! );
//! syncer.start()?;
//! // ... node runs ...
//! syncer.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`capmesh_core`] - domain types, service lifecycle, local registry
//! - [`capmesh_config`] - defaults and file-backed configuration
//! - [`capmesh_network`] - P2P seams and remote capability shims
//! - [`capmesh_syncer`] - the reconciliation engine

// Re-export the public APIs of the member crates
pub use capmesh_config as config;
pub use capmesh_core as core;
pub use capmesh_network as network;
pub use capmesh_syncer as syncer;

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use capmesh_config::{NodeConfig, SyncerConfig};
    pub use capmesh_core::{
        Capability, CapabilityId, CapabilityRegistry, CapabilityType, Don, DonId, LocalRegistry,
        PeerId, RegistryState, Service,
    };
    pub use capmesh_network::{Dispatcher, Peer, PeerWrapper, StreamConfig};
    pub use capmesh_syncer::{
        BootstrapSetup, RegistrySyncer, StateReader, SyncError, TickReport,
    };
}
