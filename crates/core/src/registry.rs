//! Node-local capability registry.
//!
//! Holds every capability instance available on this node, whether a local
//! implementation or a shim proxying a remote DON. Consumers resolve
//! capabilities by their derived [`CapabilityId`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::capability::{
    CapabilityId, CapabilityInfo, TargetCapability, TriggerCapability,
};

/// Errors surfaced by a capability registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("capability {0} already exists in the registry")]
    AlreadyExists(CapabilityId),

    #[error("capability {0} not found in the registry")]
    NotFound(CapabilityId),

    #[error("capability {0} is not a trigger")]
    NotATrigger(CapabilityId),

    #[error("capability {0} is not a target")]
    NotATarget(CapabilityId),
}

/// A registered capability instance, tagged by its interface.
#[derive(Clone)]
pub enum CapabilityEntry {
    Trigger(Arc<dyn TriggerCapability>),
    Target(Arc<dyn TargetCapability>),
}

impl CapabilityEntry {
    /// Metadata of the underlying instance.
    pub fn info(&self) -> CapabilityInfo {
        match self {
            CapabilityEntry::Trigger(t) => t.info(),
            CapabilityEntry::Target(t) => t.info(),
        }
    }
}

/// Read/write surface of the node's capability registry.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    /// Adds a capability instance under its derived identity.
    async fn add(&self, entry: CapabilityEntry) -> Result<(), RegistryError>;

    /// Resolves a capability instance.
    async fn get(&self, id: &CapabilityId) -> Result<CapabilityEntry, RegistryError>;

    /// Resolves a trigger capability.
    async fn get_trigger(&self, id: &CapabilityId)
        -> Result<Arc<dyn TriggerCapability>, RegistryError>;

    /// Resolves a target capability.
    async fn get_target(&self, id: &CapabilityId)
        -> Result<Arc<dyn TargetCapability>, RegistryError>;

    /// Removes a capability instance, if present.
    async fn remove(&self, id: &CapabilityId);
}

/// In-process [`CapabilityRegistry`] backed by a concurrent map.
#[derive(Default)]
pub struct LocalRegistry {
    entries: DashMap<CapabilityId, CapabilityEntry>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CapabilityRegistry for LocalRegistry {
    async fn add(&self, entry: CapabilityEntry) -> Result<(), RegistryError> {
        let id = entry.info().id;
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegistryError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(capability_id = %id, "registered capability");
                slot.insert(entry);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &CapabilityId) -> Result<CapabilityEntry, RegistryError> {
        self.entries
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(RegistryError::NotFound(*id))
    }

    async fn get_trigger(
        &self,
        id: &CapabilityId,
    ) -> Result<Arc<dyn TriggerCapability>, RegistryError> {
        match self.get(id).await? {
            CapabilityEntry::Trigger(t) => Ok(t),
            CapabilityEntry::Target(_) => Err(RegistryError::NotATrigger(*id)),
        }
    }

    async fn get_target(
        &self,
        id: &CapabilityId,
    ) -> Result<Arc<dyn TargetCapability>, RegistryError> {
        match self.get(id).await? {
            CapabilityEntry::Target(t) => Ok(t),
            CapabilityEntry::Trigger(_) => Err(RegistryError::NotATarget(*id)),
        }
    }

    async fn remove(&self, id: &CapabilityId) {
        if self.entries.remove(id).is_some() {
            debug!(capability_id = %id, "removed capability");
        }
    }
}
