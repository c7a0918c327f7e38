//! Message dispatch between capability shims.
//!
//! The dispatcher owns the binding table from `(capability, don)` routing
//! keys to receivers. The real transport implements this trait over P2P
//! streams; [`InProcessNetwork`] provides a multi-node in-process fabric for
//! tests and dev-mode wiring.

use std::sync::Arc;

use async_trait::async_trait;
use capmesh_core::{CapabilityId, DonId, PeerId};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::message::RemoteMessage;

/// A shim endpoint able to accept dispatched messages.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive(&self, message: RemoteMessage);
}

/// Routing surface consumed by the reconciliation engine and the shims.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Binds `receiver` as the handler for `(capability_id, don_id)`.
    /// Rejects a duplicate binding with [`NetworkError::ReceiverExists`].
    async fn set_receiver(
        &self,
        capability_id: CapabilityId,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> NetworkResult<()>;

    /// Removes the binding for `(capability_id, don_id)`, if present.
    async fn remove_receiver(&self, capability_id: &CapabilityId, don_id: DonId);

    /// Sends a message to the given peer.
    async fn send(&self, peer: PeerId, message: RemoteMessage) -> NetworkResult<()>;
}

type RouteKey = (PeerId, CapabilityId, DonId);

/// In-process message fabric connecting any number of simulated nodes.
///
/// Undeliverable messages are dropped, matching transport semantics where a
/// disconnected peer silently loses traffic.
#[derive(Default)]
pub struct InProcessNetwork {
    receivers: DashMap<RouteKey, Arc<dyn Receiver>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A dispatcher bound to one simulated node of this fabric.
    pub fn dispatcher_for(self: &Arc<Self>, node: PeerId) -> Arc<InProcessDispatcher> {
        Arc::new(InProcessDispatcher {
            node,
            network: self.clone(),
        })
    }

    /// Routing keys currently bound on the given node, for inspection.
    pub fn bindings_for(&self, node: &PeerId) -> Vec<(CapabilityId, DonId)> {
        self.receivers
            .iter()
            .filter(|entry| entry.key().0 == *node)
            .map(|entry| (entry.key().1, entry.key().2))
            .collect()
    }
}

/// One node's [`Dispatcher`] handle onto an [`InProcessNetwork`].
pub struct InProcessDispatcher {
    node: PeerId,
    network: Arc<InProcessNetwork>,
}

#[async_trait]
impl Dispatcher for InProcessDispatcher {
    async fn set_receiver(
        &self,
        capability_id: CapabilityId,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> NetworkResult<()> {
        let key = (self.node, capability_id, don_id);
        match self.network.receivers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(NetworkError::ReceiverExists {
                capability_id,
                don_id,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(capability_id = %capability_id.short(), don_id = %don_id, "bound receiver");
                slot.insert(receiver);
                Ok(())
            }
        }
    }

    async fn remove_receiver(&self, capability_id: &CapabilityId, don_id: DonId) {
        let key = (self.node, *capability_id, don_id);
        if self.network.receivers.remove(&key).is_some() {
            debug!(capability_id = %capability_id.short(), don_id = %don_id, "removed receiver");
        }
    }

    async fn send(&self, peer: PeerId, message: RemoteMessage) -> NetworkResult<()> {
        if message.payload.len() > capmesh_config::DEFAULT_MAX_MESSAGE_LEN_BYTES {
            return Err(NetworkError::MessageTooLarge {
                len: message.payload.len(),
                max: capmesh_config::DEFAULT_MAX_MESSAGE_LEN_BYTES,
            });
        }
        let key = (peer, message.capability_id, message.don_id);
        let receiver = self.network.receivers.get(&key).map(|r| r.value().clone());
        match receiver {
            Some(receiver) => {
                receiver.receive(message).await;
                Ok(())
            }
            None => {
                warn!(
                    peer = %peer.short(),
                    capability_id = %message.capability_id.short(),
                    don_id = %message.don_id,
                    "no receiver for message; dropping"
                );
                Ok(())
            }
        }
    }
}
