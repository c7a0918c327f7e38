//! Core domain types for the capmesh capability network.
//!
//! This crate defines the value types shared by every other capmesh crate:
//! peer identities, DON descriptors, capability descriptors, registry
//! snapshots, the service lifecycle trait, and the node-local capability
//! registry.

pub mod capability;
pub mod don;
pub mod error;
pub mod peer_id;
pub mod registry;
pub mod service;
pub mod state;

pub use capability::{
    BaseCapability, Capability, CapabilityId, CapabilityInfo, CapabilityType, TargetCapability,
    TargetRequest, TargetResponse, TriggerCapability, TriggerEvent, TriggerRegistration, Word32,
};
pub use don::{CapabilityConfiguration, Don, DonId, DonInfo};
pub use error::{CoreError, CoreResult};
pub use peer_id::{PeerId, PEER_ID_SIZE};
pub use registry::{CapabilityEntry, CapabilityRegistry, LocalRegistry, RegistryError};
pub use service::Service;
pub use state::{NodeInfo, RegistryState, SIGNER_SIZE};
