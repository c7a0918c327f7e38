//! DON (decentralized oracle network) descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityId;
use crate::peer_id::PeerId;

/// Registry identifier of a DON.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DonId(pub u32);

impl fmt::Display for DonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A capability hosted by a DON, with its DON-specific configuration blob.
#[derive(Debug, Clone)]
pub struct CapabilityConfiguration {
    pub capability_id: CapabilityId,
    pub config: Vec<u8>,
}

/// A DON as described by the on-chain registry.
#[derive(Debug, Clone)]
pub struct Don {
    pub id: DonId,
    /// Whether this DON's capabilities can be accessed publicly.
    pub is_public: bool,
    /// Whether this DON executes workflows.
    pub accepts_workflows: bool,
    /// Maximum number of faulty members tolerated; quorum is `f + 1`.
    pub f: u8,
    /// Members, by their P2P identities.
    pub members: Vec<PeerId>,
    /// Capabilities hosted by this DON.
    pub capability_configurations: Vec<CapabilityConfiguration>,
}

impl Don {
    /// Number of matching responses required to trust this DON's output.
    pub fn quorum(&self) -> usize {
        self.f as usize + 1
    }

    /// Whether the given peer is a member of this DON.
    pub fn has_member(&self, id: &PeerId) -> bool {
        self.members.contains(id)
    }

    /// The member/quorum summary handed to capability shims.
    pub fn info(&self) -> DonInfo {
        DonInfo {
            id: self.id,
            members: self.members.clone(),
            f: self.f,
        }
    }
}

/// The subset of a DON's description that shims need at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonInfo {
    pub id: DonId,
    pub members: Vec<PeerId>,
    pub f: u8,
}

impl DonInfo {
    /// Number of matching responses required to trust this DON's output.
    pub fn quorum(&self) -> usize {
        self.f as usize + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn don_with_f(f: u8) -> Don {
        Don {
            id: DonId(7),
            is_public: true,
            accepts_workflows: false,
            f,
            members: vec![PeerId::from_bytes([1u8; 32]), PeerId::from_bytes([2u8; 32])],
            capability_configurations: Vec::new(),
        }
    }

    #[test]
    fn quorum_is_f_plus_one() {
        assert_eq!(don_with_f(0).quorum(), 1);
        assert_eq!(don_with_f(2).quorum(), 3);
        assert_eq!(don_with_f(2).info().quorum(), 3);
    }

    #[test]
    fn membership_check() {
        let don = don_with_f(1);
        assert!(don.has_member(&PeerId::from_bytes([1u8; 32])));
        assert!(!don.has_member(&PeerId::from_bytes([3u8; 32])));
    }
}
