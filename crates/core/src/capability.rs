//! Capability descriptors and capability interfaces.
//!
//! A capability is a unit of remotely invokable functionality identified by
//! a labelled name and a version, both stored as 32-byte registry words to
//! match the on-chain representation. The derived [`CapabilityId`] is the
//! stable identity used for registry lookups and dispatcher bindings.

use std::fmt;

use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::don::{DonId, DonInfo};
use crate::error::{CoreError, CoreResult};

/// A 32-byte, NUL-padded UTF-8 word as stored by the registry contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Word32 {
    bytes: [u8; 32],
    len: u8,
}

impl Word32 {
    /// Builds a word from a string of at most 32 bytes.
    pub fn new(s: &str) -> CoreResult<Self> {
        if s.len() > 32 {
            return Err(CoreError::WordTooLong(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self {
            bytes,
            len: s.len() as u8,
        })
    }

    /// Builds a word from raw contract bytes, validating the UTF-8 content.
    pub fn try_from_bytes(bytes: [u8; 32]) -> CoreResult<Self> {
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(32);
        std::str::from_utf8(&bytes[..len]).map_err(|_| CoreError::WordNotUtf8)?;
        Ok(Self {
            bytes,
            len: len as u8,
        })
    }

    /// The word content without NUL padding.
    pub fn as_str(&self) -> &str {
        // Validated at construction.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    /// The raw 32-byte form.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Display for Word32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Word32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word32({})", self.as_str())
    }
}

/// Derived capability identity: `sha256(labelled_name || version)`, hex encoded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityId([u8; 32]);

impl CapabilityId {
    /// Derives the identity for a (labelled name, version) pair.
    pub fn derive(labelled_name: &Word32, version: &Word32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(labelled_name.as_bytes());
        hasher.update(version.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Short text form for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityId({})", self.short())
    }
}

impl Serialize for CapabilityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CapabilityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(D::Error::custom)?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("capability id must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// The registry's capability taxonomy.
///
/// Unknown tags fail conversion instead of falling through a default branch,
/// so a new on-chain capability type surfaces as a structural error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityType {
    Trigger,
    Action,
    Consensus,
    Target,
}

impl CapabilityType {
    /// The on-chain tag for this type.
    pub fn tag(&self) -> u8 {
        match self {
            CapabilityType::Trigger => 0,
            CapabilityType::Action => 1,
            CapabilityType::Consensus => 2,
            CapabilityType::Target => 3,
        }
    }
}

impl TryFrom<u8> for CapabilityType {
    type Error = CoreError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(CapabilityType::Trigger),
            1 => Ok(CapabilityType::Action),
            2 => Ok(CapabilityType::Consensus),
            3 => Ok(CapabilityType::Target),
            other => Err(CoreError::UnknownCapabilityType(other)),
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CapabilityType::Trigger => "trigger",
            CapabilityType::Action => "action",
            CapabilityType::Consensus => "consensus",
            CapabilityType::Target => "target",
        };
        f.write_str(s)
    }
}

/// A capability as registered on-chain.
#[derive(Debug, Clone)]
pub struct Capability {
    pub labelled_name: Word32,
    pub version: Word32,
    pub capability_type: CapabilityType,
    pub response_type: u8,
}

impl Capability {
    /// The derived registry identity of this capability.
    pub fn id(&self) -> CapabilityId {
        CapabilityId::derive(&self.labelled_name, &self.version)
    }
}

/// Descriptive metadata attached to a capability instance.
#[derive(Debug, Clone)]
pub struct CapabilityInfo {
    pub id: CapabilityId,
    pub capability_type: CapabilityType,
    pub description: String,
    pub version: String,
    /// The DON this capability is hosted on, when remote.
    pub don: Option<DonInfo>,
}

impl CapabilityInfo {
    /// Metadata for a shim proxying a capability hosted on a remote DON.
    pub fn remote(capability: &Capability, don: DonInfo) -> Self {
        Self {
            id: capability.id(),
            capability_type: capability.capability_type,
            description: format!(
                "remote {} {}@{}",
                capability.capability_type, capability.labelled_name, capability.version
            ),
            version: capability.version.to_string(),
            don: Some(don),
        }
    }
}

/// An asynchronous event emitted by a trigger capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Identity of the underlying event occurrence, stable across nodes so
    /// responses for the same occurrence can be aggregated.
    pub event_id: String,
    pub payload: Vec<u8>,
}

/// A request to start receiving events from a trigger capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRegistration {
    pub subscriber_id: String,
}

/// A request executed by a target capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRequest {
    pub request_id: String,
    pub caller_don: DonId,
    pub payload: Vec<u8>,
}

/// The response to a [`TargetRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResponse {
    pub request_id: String,
    pub payload: Vec<u8>,
}

/// Common surface of every capability instance.
pub trait BaseCapability: Send + Sync {
    fn info(&self) -> CapabilityInfo;
}

/// A capability that emits asynchronous events to subscribers.
#[async_trait]
pub trait TriggerCapability: BaseCapability {
    /// Registers a subscriber and returns its event stream.
    async fn register_trigger(
        &self,
        registration: TriggerRegistration,
    ) -> CoreResult<mpsc::Receiver<TriggerEvent>>;

    /// Removes a previously registered subscriber.
    async fn unregister_trigger(&self, registration: TriggerRegistration) -> CoreResult<()>;
}

/// A capability that executes a request/response action.
#[async_trait]
pub trait TargetCapability: BaseCapability {
    async fn execute(&self, request: TargetRequest) -> CoreResult<TargetResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_pads_and_trims() {
        let w = Word32::new("data-streams-report").expect("fits");
        assert_eq!(w.as_str(), "data-streams-report");
        assert_eq!(w.as_bytes()[19..], [0u8; 13]);
    }

    #[test]
    fn word_rejects_oversized() {
        let long = "x".repeat(33);
        assert!(matches!(
            Word32::new(&long),
            Err(CoreError::WordTooLong(_))
        ));
    }

    #[test]
    fn word_from_bytes_validates_utf8() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xff;
        bytes[1] = 0xfe;
        assert!(matches!(
            Word32::try_from_bytes(bytes),
            Err(CoreError::WordNotUtf8)
        ));
    }

    #[test]
    fn capability_id_is_stable_per_name_and_version() {
        let cap = Capability {
            labelled_name: Word32::new("write-chain").expect("fits"),
            version: Word32::new("1.0.1").expect("fits"),
            capability_type: CapabilityType::Target,
            response_type: 1,
        };
        assert_eq!(cap.id(), cap.id());

        let other = Capability {
            version: Word32::new("1.0.2").expect("fits"),
            ..cap.clone()
        };
        assert_ne!(cap.id(), other.id());
    }

    #[test]
    fn capability_type_tags_round_trip() {
        for tag in 0u8..4 {
            let ty = CapabilityType::try_from(tag).expect("known tag");
            assert_eq!(ty.tag(), tag);
        }
        assert!(matches!(
            CapabilityType::try_from(4),
            Err(CoreError::UnknownCapabilityType(4))
        ));
    }
}
