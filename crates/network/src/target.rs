//! Remote target shims.
//!
//! [`TargetClient`] is the client side: it runs on workflow-DON nodes and
//! forwards execution requests to the members of the capability DON,
//! resolving the first response that comes back within the request timeout.
//! [`TargetReceiver`] is the server side: it accepts requests from members
//! of authorized workflow DONs, executes the local target implementation,
//! and addresses the response back to the calling peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capmesh_core::{
    BaseCapability, CapabilityInfo, CoreError, CoreResult, DonId, DonInfo, PeerId, Service,
    TargetCapability, TargetRequest, TargetResponse,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, Receiver};
use crate::message::{decode, encode, ExecuteResponseEnvelope, MessageKind, RemoteMessage};

type PendingResponses = Mutex<HashMap<String, oneshot::Sender<Result<TargetResponse, String>>>>;

/// Client-side shim for a target capability hosted on a remote DON.
pub struct TargetClient {
    info: CapabilityInfo,
    capability_don: DonInfo,
    workflow_don_id: DonId,
    dispatcher: Arc<dyn Dispatcher>,
    local_peer: PeerId,
    request_timeout: Duration,
    pending: PendingResponses,
    running: Mutex<bool>,
}

impl TargetClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: CapabilityInfo,
        capability_don: DonInfo,
        workflow_don_id: DonId,
        dispatcher: Arc<dyn Dispatcher>,
        local_peer: PeerId,
        request_timeout: Duration,
    ) -> Self {
        Self {
            info,
            capability_don,
            workflow_don_id,
            dispatcher,
            local_peer,
            request_timeout,
            pending: Mutex::new(HashMap::new()),
            running: Mutex::new(false),
        }
    }

    /// The per-request timeout this client applies.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl BaseCapability for TargetClient {
    fn info(&self) -> CapabilityInfo {
        self.info.clone()
    }
}

#[async_trait]
impl TargetCapability for TargetClient {
    async fn execute(&self, request: TargetRequest) -> CoreResult<TargetResponse> {
        if !*self.running.lock() {
            return Err(CoreError::NotRunning("target-client"));
        }
        let request_id = if request.request_id.is_empty() {
            format!("{:016x}", rand::random::<u64>())
        } else {
            request.request_id
        };
        let request = TargetRequest {
            request_id: request_id.clone(),
            caller_don: self.workflow_don_id,
            payload: request.payload,
        };
        let payload = encode(&request).map_err(|e| CoreError::Capability(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        for member in &self.capability_don.members {
            let message = RemoteMessage {
                capability_id: self.info.id,
                don_id: self.capability_don.id,
                sender: self.local_peer,
                kind: MessageKind::ExecuteRequest,
                payload: payload.clone(),
            };
            if let Err(e) = self.dispatcher.send(*member, message).await {
                warn!(peer = %member.short(), error = %e, "target request send failed");
            }
        }

        let outcome = tokio::time::timeout(self.request_timeout, rx).await;
        self.pending.lock().remove(&request_id);
        match outcome {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(remote))) => Err(CoreError::Capability(remote)),
            Ok(Err(_)) => Err(CoreError::ChannelClosed("target response")),
            Err(_) => Err(CoreError::Capability(format!(
                "request {request_id} timed out"
            ))),
        }
    }
}

#[async_trait]
impl Service for TargetClient {
    fn name(&self) -> &'static str {
        "target-client"
    }

    async fn start(&self) -> CoreResult<()> {
        let mut running = self.running.lock();
        if *running {
            return Err(CoreError::AlreadyStarted(self.name()));
        }
        *running = true;
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        {
            let mut running = self.running.lock();
            if !*running {
                return Err(CoreError::NotRunning(self.name()));
            }
            *running = false;
        }
        // Dropping the pending senders fails any in-flight requests promptly.
        self.pending.lock().clear();
        Ok(())
    }
}

#[async_trait]
impl Receiver for TargetClient {
    async fn receive(&self, message: RemoteMessage) {
        if message.kind != MessageKind::ExecuteResponse {
            debug!(kind = ?message.kind, "target client ignoring unexpected message kind");
            return;
        }
        if !self.capability_don.members.contains(&message.sender) {
            warn!(
                peer = %message.sender.short(),
                "target response from non-member of the capability DON; dropping"
            );
            return;
        }
        let envelope: ExecuteResponseEnvelope = match decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable target response payload");
                return;
            }
        };
        let Some(tx) = self.pending.lock().remove(&envelope.request_id) else {
            debug!(
                request_id = %envelope.request_id,
                "response for unknown or already-resolved request; dropping"
            );
            return;
        };
        let _ = tx.send(envelope.result);
    }
}

/// Server-side shim exposing a local target capability to remote workflow
/// DONs.
pub struct TargetReceiver {
    underlying: Arc<dyn TargetCapability>,
    info: CapabilityInfo,
    capability_don: DonInfo,
    workflow_dons: HashMap<DonId, DonInfo>,
    dispatcher: Arc<dyn Dispatcher>,
    local_peer: PeerId,
    request_timeout: Duration,
    running: Mutex<bool>,
}

impl TargetReceiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        underlying: Arc<dyn TargetCapability>,
        info: CapabilityInfo,
        capability_don: DonInfo,
        workflow_dons: HashMap<DonId, DonInfo>,
        dispatcher: Arc<dyn Dispatcher>,
        local_peer: PeerId,
        request_timeout: Duration,
    ) -> Self {
        Self {
            underlying,
            info,
            capability_don,
            workflow_dons,
            dispatcher,
            local_peer,
            request_timeout,
            running: Mutex::new(false),
        }
    }

    fn authorized(&self, caller_don: DonId, sender: &PeerId) -> bool {
        self.workflow_dons
            .get(&caller_don)
            .is_some_and(|don| don.members.contains(sender))
    }
}

#[async_trait]
impl Service for TargetReceiver {
    fn name(&self) -> &'static str {
        "target-receiver"
    }

    async fn start(&self) -> CoreResult<()> {
        let mut running = self.running.lock();
        if *running {
            return Err(CoreError::AlreadyStarted(self.name()));
        }
        *running = true;
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        let mut running = self.running.lock();
        if !*running {
            return Err(CoreError::NotRunning(self.name()));
        }
        *running = false;
        Ok(())
    }
}

#[async_trait]
impl Receiver for TargetReceiver {
    async fn receive(&self, message: RemoteMessage) {
        if message.kind != MessageKind::ExecuteRequest {
            debug!(kind = ?message.kind, "target receiver ignoring unexpected message kind");
            return;
        }
        if !*self.running.lock() {
            return;
        }
        let request: TargetRequest = match decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable target request payload");
                return;
            }
        };
        if !self.authorized(request.caller_don, &message.sender) {
            warn!(
                don_id = %request.caller_don,
                peer = %message.sender.short(),
                "target request from unauthorized caller; dropping"
            );
            return;
        }

        let request_id = request.request_id.clone();
        let result = match tokio::time::timeout(
            self.request_timeout,
            self.underlying.execute(request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("local target execution timed out".to_string()),
        };

        let envelope = ExecuteResponseEnvelope { request_id, result };
        let payload = match encode(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode target response");
                return;
            }
        };
        let response = RemoteMessage {
            capability_id: self.info.id,
            don_id: self.capability_don.id,
            sender: self.local_peer,
            kind: MessageKind::ExecuteResponse,
            payload,
        };
        if let Err(e) = self.dispatcher.send(message.sender, response).await {
            warn!(peer = %message.sender.short(), error = %e, "target response send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::InProcessNetwork;
    use capmesh_core::{CapabilityId, CapabilityType, Word32};

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; 32])
    }

    fn target_info(don: &DonInfo) -> CapabilityInfo {
        let name = Word32::new("write-chain").expect("fits");
        let version = Word32::new("1.0.1").expect("fits");
        CapabilityInfo {
            id: CapabilityId::derive(&name, &version),
            capability_type: CapabilityType::Target,
            description: "test target".to_string(),
            version: "1.0.1".to_string(),
            don: Some(don.clone()),
        }
    }

    fn capability_don() -> DonInfo {
        DonInfo {
            id: DonId(300),
            members: vec![peer(21)],
            f: 0,
        }
    }

    fn workflow_don() -> DonInfo {
        DonInfo {
            id: DonId(100),
            members: vec![peer(1)],
            f: 0,
        }
    }

    struct Echo {
        info: CapabilityInfo,
    }

    impl BaseCapability for Echo {
        fn info(&self) -> CapabilityInfo {
            self.info.clone()
        }
    }

    #[async_trait]
    impl TargetCapability for Echo {
        async fn execute(&self, request: TargetRequest) -> CoreResult<TargetResponse> {
            if request.payload == b"fail" {
                return Err(CoreError::Capability("write reverted".to_string()));
            }
            Ok(TargetResponse {
                request_id: request.request_id,
                payload: request.payload,
            })
        }
    }

    async fn wire_pair(
        network: &Arc<InProcessNetwork>,
        request_timeout: Duration,
    ) -> (Arc<TargetClient>, Arc<TargetReceiver>) {
        let cap_don = capability_don();
        let wf_don = workflow_don();
        let info = target_info(&cap_don);

        let client = Arc::new(TargetClient::new(
            info.clone(),
            cap_don.clone(),
            wf_don.id,
            network.dispatcher_for(peer(1)),
            peer(1),
            request_timeout,
        ));
        let receiver = Arc::new(TargetReceiver::new(
            Arc::new(Echo { info: info.clone() }),
            info.clone(),
            cap_don.clone(),
            HashMap::from([(wf_don.id, wf_don.clone())]),
            network.dispatcher_for(peer(21)),
            peer(21),
            request_timeout,
        ));

        client.start().await.expect("start client");
        receiver.start().await.expect("start receiver");
        network
            .dispatcher_for(peer(1))
            .set_receiver(info.id, cap_don.id, client.clone())
            .await
            .expect("bind client");
        network
            .dispatcher_for(peer(21))
            .set_receiver(info.id, cap_don.id, receiver.clone())
            .await
            .expect("bind receiver");
        (client, receiver)
    }

    #[tokio::test]
    async fn round_trips_a_request() {
        let network = InProcessNetwork::new();
        let (client, receiver) = wire_pair(&network, Duration::from_secs(5)).await;

        let response = client
            .execute(TargetRequest {
                request_id: String::new(),
                caller_don: DonId(0),
                payload: b"store 42".to_vec(),
            })
            .await
            .expect("round trip");
        assert_eq!(response.payload, b"store 42");

        client.close().await.expect("close client");
        receiver.close().await.expect("close receiver");
    }

    #[tokio::test]
    async fn propagates_remote_execution_errors() {
        let network = InProcessNetwork::new();
        let (client, _receiver) = wire_pair(&network, Duration::from_secs(5)).await;

        let err = client
            .execute(TargetRequest {
                request_id: String::new(),
                caller_don: DonId(0),
                payload: b"fail".to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Capability(msg) if msg.contains("write reverted")));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_a_responder() {
        let network = InProcessNetwork::new();
        let cap_don = capability_don();
        let info = target_info(&cap_don);

        // No receiver bound anywhere: the request is dropped by the fabric.
        let client = TargetClient::new(
            info,
            cap_don,
            workflow_don().id,
            network.dispatcher_for(peer(1)),
            peer(1),
            Duration::from_millis(100),
        );
        client.start().await.expect("start");

        let err = client
            .execute(TargetRequest {
                request_id: String::new(),
                caller_don: DonId(0),
                payload: b"store".to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Capability(msg) if msg.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_unauthorized_callers() {
        let network = InProcessNetwork::new();
        let cap_don = capability_don();
        let wf_don = workflow_don();
        let info = target_info(&cap_don);

        let receiver = Arc::new(TargetReceiver::new(
            Arc::new(Echo { info: info.clone() }),
            info.clone(),
            cap_don.clone(),
            HashMap::from([(wf_don.id, wf_don.clone())]),
            network.dispatcher_for(peer(21)),
            peer(21),
            Duration::from_secs(1),
        ));
        receiver.start().await.expect("start");
        network
            .dispatcher_for(peer(21))
            .set_receiver(info.id, cap_don.id, receiver.clone())
            .await
            .expect("bind");

        // Client claiming a DON the receiver does not authorize.
        let client = TargetClient::new(
            info,
            cap_don,
            DonId(999),
            network.dispatcher_for(peer(1)),
            peer(1),
            Duration::from_millis(100),
        );
        client.start().await.expect("start");

        let err = client
            .execute(TargetRequest {
                request_id: String::new(),
                caller_don: DonId(0),
                payload: b"store".to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Capability(msg) if msg.contains("timed out")));
    }
}
