//! Wire messages exchanged between capability shims.

use capmesh_core::{
    CapabilityId, DonId, PeerId, TargetResponse, TriggerRegistration, SIGNER_SIZE,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// Discriminates the payload of a [`RemoteMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    RegisterTrigger,
    UnregisterTrigger,
    TriggerEvent,
    ExecuteRequest,
    ExecuteResponse,
}

/// A message routed by the dispatcher.
///
/// `capability_id` and `don_id` form the routing key; `don_id` is always the
/// id of the DON hosting the capability, on both request and response legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub capability_id: CapabilityId,
    pub don_id: DonId,
    pub sender: PeerId,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Payload of a [`MessageKind::RegisterTrigger`] message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRegistrationEnvelope {
    pub registration: TriggerRegistration,
    /// The workflow DON the registering node belongs to.
    pub workflow_don: DonId,
}

/// Payload of a [`MessageKind::ExecuteResponse`] message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponseEnvelope {
    pub request_id: String,
    pub result: Result<TargetResponse, String>,
}

/// Payload of a [`MessageKind::TriggerEvent`] message: an event plus the
/// signer address of the emitting node, consumed by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTriggerEvent {
    pub event: capmesh_core::TriggerEvent,
    pub signer: [u8; SIGNER_SIZE],
}

/// Encodes a payload for transport.
pub fn encode<T: Serialize>(value: &T) -> NetworkResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| NetworkError::Codec(e.to_string()))
}

/// Decodes a payload received from transport.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> NetworkResult<T> {
    bincode::deserialize(bytes).map_err(|e| NetworkError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_core::TriggerEvent;

    #[test]
    fn payload_round_trip() {
        let envelope = SignedTriggerEvent {
            event: TriggerEvent {
                event_id: "feed-1@1700000000".to_string(),
                payload: vec![1, 2, 3],
            },
            signer: [0xab; SIGNER_SIZE],
        };
        let bytes = encode(&envelope).expect("encode");
        let back: SignedTriggerEvent = decode(&bytes).expect("decode");
        assert_eq!(envelope, back);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode::<SignedTriggerEvent>(&[0xff, 0x00, 0x01]).is_err());
    }
}
