//! Registry-driven topology reconciliation.
//!
//! The [`RegistrySyncer`] keeps this node's runtime state — its P2P peer
//! connections and its local capability shims — in step with the on-chain
//! capability registry. Each tick it snapshots the registry, classifies the
//! node's role relative to every public DON, replaces the desired peer set,
//! and installs or removes capability shims to match.

pub mod bootstrap;
pub mod classifier;
pub mod error;
pub mod factory;
pub mod reader;
pub mod syncer;
pub mod topology;

pub use bootstrap::BootstrapSetup;
pub use classifier::{classify, DonClassification};
pub use error::{ShimError, SyncError, SyncResult};
pub use factory::{BuiltShim, Discovery, ShimFactory, ShimKey};
pub use reader::{
    BoundContract, RawCapability, ReadError, RegistryContract, RemoteRegistryReader,
    SimulatedRegistryContract, StateReader,
};
pub use syncer::{RegistrySyncer, ShimFailure, SnapshotSource, TickReport};
pub use topology::desired_peer_set;
