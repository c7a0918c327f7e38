//! P2P peer identities.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Size of a peer id in bytes (an ed25519-style public key).
pub const PEER_ID_SIZE: usize = 32;

/// Identity of a node on the P2P transport.
///
/// The canonical text form is base58, matching the transport's key encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Creates a peer id from its raw key bytes.
    pub const fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// The all-zero peer id, used as a placeholder before a real identity is known.
    pub const fn zero() -> Self {
        Self([0u8; PEER_ID_SIZE])
    }

    /// Short text form for log output.
    pub fn short(&self) -> String {
        let full = self.to_string();
        if full.len() <= 12 {
            full
        } else {
            format!("{}…", &full[..12])
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| CoreError::InvalidPeerId {
                value: s.to_string(),
                reason: e.to_string(),
            })?;
        let bytes: [u8; PEER_ID_SIZE] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::InvalidPeerId {
                    value: s.to_string(),
                    reason: format!("expected {PEER_ID_SIZE} bytes, got {}", decoded.len()),
                })?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
