//! Capability shim construction.
//!
//! The factory dispatches on the capability type and builds the matching
//! client- or server-side shim. Action and consensus capabilities have no
//! remote shim; asking for one yields a typed error the caller records
//! without aborting the rest of the tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capmesh_config::SyncerConfig;
use capmesh_core::{
    Capability, CapabilityEntry, CapabilityId, CapabilityInfo, CapabilityRegistry, CapabilityType,
    Don, DonId, PeerId, RegistryError, RegistryState, Service,
};
use capmesh_network::{
    Dispatcher, Receiver, RemoteTriggerConfig, SignedAggregator, TargetClient, TargetReceiver,
    TriggerPublisher, TriggerSubscriber,
};
use tokio::sync::watch;
use tracing::debug;

use crate::error::ShimError;

/// Identity of a tracked shim: one shim per (capability, DON) pair.
pub type ShimKey = (CapabilityId, DonId);

/// A shim ready for the install chain.
///
/// The same concrete instance is viewed through its three roles: the
/// registry entry (client shims only), the dispatcher receiver, and the
/// tracked service.
pub struct BuiltShim {
    pub key: ShimKey,
    /// Present for client shims, which are published in the local registry.
    pub entry: Option<CapabilityEntry>,
    pub receiver: Arc<dyn Receiver>,
    pub service: Arc<dyn Service>,
}

impl std::fmt::Debug for BuiltShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltShim")
            .field("key", &self.key)
            .field("has_entry", &self.entry.is_some())
            .finish_non_exhaustive()
    }
}

/// How to resolve the underlying local capability for a server-side shim.
pub enum Discovery {
    /// One registry lookup; a miss is reported and retried next tick.
    Single,
    /// Bounded polling for a capability that may not be published yet,
    /// aborting promptly if shutdown is requested.
    Retry { attempts: u32, delay: Duration },
}

/// Builds capability shims for one reconciliation tick.
pub struct ShimFactory {
    registry: Arc<dyn CapabilityRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    config: SyncerConfig,
    local_peer: PeerId,
}

impl ShimFactory {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        config: SyncerConfig,
        local_peer: PeerId,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
            local_peer,
        }
    }

    fn trigger_config(&self, quorum: usize) -> RemoteTriggerConfig {
        RemoteTriggerConfig {
            registration_refresh: self.config.registration_refresh(),
            registration_expiry: self.config.registration_expiry(),
            min_responses_to_aggregate: quorum,
        }
    }

    /// Builds the client-side shim for a capability hosted on a remote DON.
    ///
    /// `workflow_don` is the workflow DON this node consumes the capability
    /// from; `capability_don` is the remote DON hosting it.
    pub fn build_client_shim(
        &self,
        capability: &Capability,
        capability_don: &Don,
        workflow_don: &Don,
        state: &RegistryState,
    ) -> Result<BuiltShim, ShimError> {
        let key = (capability.id(), capability_don.id);
        let info = CapabilityInfo::remote(capability, capability_don.info());

        match capability.capability_type {
            CapabilityType::Trigger => {
                // Signers come from the capability DON's membership, not the
                // workflow DON's.
                let signers = state.signers_for(capability_don)?;
                let aggregator = SignedAggregator::new(signers, capability_don.quorum());
                let subscriber = Arc::new(TriggerSubscriber::new(
                    self.trigger_config(capability_don.quorum()),
                    info,
                    capability_don.info(),
                    workflow_don.info(),
                    self.local_peer,
                    self.dispatcher.clone(),
                    aggregator,
                ));
                Ok(BuiltShim {
                    key,
                    entry: Some(CapabilityEntry::Trigger(subscriber.clone())),
                    receiver: subscriber.clone(),
                    service: subscriber,
                })
            }
            CapabilityType::Target => {
                let client = Arc::new(TargetClient::new(
                    info,
                    capability_don.info(),
                    workflow_don.id,
                    self.dispatcher.clone(),
                    self.local_peer,
                    self.config.target_request_timeout(),
                ));
                Ok(BuiltShim {
                    key,
                    entry: Some(CapabilityEntry::Target(client.clone())),
                    receiver: client.clone(),
                    service: client,
                })
            }
            other @ (CapabilityType::Action | CapabilityType::Consensus) => {
                Err(ShimError::UnsupportedCapabilityType(other))
            }
        }
    }

    /// Builds the server-side shim exposing a local capability to the given
    /// remote workflow DONs.
    pub async fn build_server_shim(
        &self,
        capability: &Capability,
        capability_don: &Don,
        remote_workflow_dons: &[Don],
        state: &RegistryState,
        discovery: Discovery,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<BuiltShim, ShimError> {
        let key = (capability.id(), capability_don.id);
        let info = CapabilityInfo::remote(capability, capability_don.info());
        let workflow_dons: HashMap<DonId, _> = remote_workflow_dons
            .iter()
            .map(|d| (d.id, d.info()))
            .collect();

        match capability.capability_type {
            CapabilityType::Trigger => {
                let underlying = self
                    .resolve_local_trigger(&capability.id(), discovery, stop_rx)
                    .await?;
                let signer = state
                    .node(&self.local_peer)
                    .ok_or(capmesh_core::CoreError::UnknownNode(self.local_peer))?
                    .signer;
                let publisher = Arc::new(TriggerPublisher::new(
                    self.trigger_config(capability_don.quorum()),
                    underlying,
                    info,
                    capability_don.info(),
                    workflow_dons,
                    self.dispatcher.clone(),
                    self.local_peer,
                    signer,
                ));
                Ok(BuiltShim {
                    key,
                    entry: None,
                    receiver: publisher.clone(),
                    service: publisher,
                })
            }
            CapabilityType::Target => {
                let underlying = self.registry.get_target(&capability.id()).await?;
                let receiver = Arc::new(TargetReceiver::new(
                    underlying,
                    info,
                    capability_don.info(),
                    workflow_dons,
                    self.dispatcher.clone(),
                    self.local_peer,
                    self.config.target_request_timeout(),
                ));
                Ok(BuiltShim {
                    key,
                    entry: None,
                    receiver: receiver.clone(),
                    service: receiver,
                })
            }
            other @ (CapabilityType::Action | CapabilityType::Consensus) => {
                Err(ShimError::UnsupportedCapabilityType(other))
            }
        }
    }

    async fn resolve_local_trigger(
        &self,
        id: &CapabilityId,
        discovery: Discovery,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<Arc<dyn capmesh_core::TriggerCapability>, ShimError> {
        let (attempts, delay) = match discovery {
            Discovery::Single => return Ok(self.registry.get_trigger(id).await?),
            Discovery::Retry { attempts, delay } => (attempts, delay),
        };

        for attempt in 1..=attempts {
            if *stop_rx.borrow() {
                return Err(ShimError::DiscoveryCancelled);
            }
            match self.registry.get_trigger(id).await {
                Ok(trigger) => return Ok(trigger),
                Err(RegistryError::NotFound(_)) => {
                    debug!(
                        capability_id = %id.short(),
                        attempt,
                        attempts,
                        "local trigger not published yet"
                    );
                }
                Err(e) => return Err(e.into()),
            }
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => return Err(ShimError::DiscoveryCancelled),
                }
            }
        }
        Err(ShimError::DiscoveryExhausted {
            capability_id: *id,
            attempts,
        })
    }
}
