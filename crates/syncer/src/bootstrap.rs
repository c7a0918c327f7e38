//! Bootstrap network description.
//!
//! Before the on-chain registry has produced a usable snapshot, the node
//! runs against a statically configured network description. The
//! description is supplied entirely by configuration and is exposed to the
//! reconciliation loop as an initial-state provider, so the bootstrap phase
//! shares the exact code path of a regular tick.

use std::collections::HashMap;

use capmesh_config::BootstrapConfig;
use capmesh_core::{
    Capability, CapabilityConfiguration, CapabilityId, CapabilityType, CoreError, CoreResult, Don,
    DonId, NodeInfo, PeerId, RegistryState, Word32, SIGNER_SIZE,
};
use capmesh_network::StreamConfig;

/// Parsed, typed form of [`BootstrapConfig`].
pub struct BootstrapSetup {
    /// Extra peers to keep connected regardless of registry content.
    pub static_peers: HashMap<PeerId, StreamConfig>,
    workflow_don: Don,
    trigger_don: Don,
    trigger_capability: Capability,
    nodes: Vec<NodeInfo>,
}

fn parse_members(members: &[String]) -> CoreResult<Vec<PeerId>> {
    members.iter().map(|m| m.parse()).collect()
}

fn parse_signer(text: &str) -> CoreResult<[u8; SIGNER_SIZE]> {
    let stripped = text.strip_prefix("0x").unwrap_or(text);
    let raw = hex::decode(stripped).map_err(|e| CoreError::InvalidSigner {
        value: text.to_string(),
        reason: e.to_string(),
    })?;
    raw.as_slice()
        .try_into()
        .map_err(|_| CoreError::InvalidSigner {
            value: text.to_string(),
            reason: format!("expected {SIGNER_SIZE} bytes, got {}", raw.len()),
        })
}

impl BootstrapSetup {
    /// Parses and validates the configured network description.
    pub fn from_config(config: &BootstrapConfig) -> CoreResult<Self> {
        let workflow_members = parse_members(&config.workflow_don.members)?;
        let trigger_members = parse_members(&config.trigger_don.members)?;

        if config.trigger_don_signers.len() != trigger_members.len() {
            return Err(CoreError::InvalidSigner {
                value: format!("{} signers", config.trigger_don_signers.len()),
                reason: format!(
                    "expected one signer per trigger DON member ({})",
                    trigger_members.len()
                ),
            });
        }
        let signers = config
            .trigger_don_signers
            .iter()
            .map(|s| parse_signer(s))
            .collect::<CoreResult<Vec<_>>>()?;

        let trigger_capability = Capability {
            labelled_name: Word32::new(&config.trigger_capability_name)?,
            version: Word32::new(&config.trigger_capability_version)?,
            capability_type: CapabilityType::Trigger,
            response_type: 0,
        };

        let workflow_don = Don {
            id: DonId(config.workflow_don.id),
            is_public: true,
            accepts_workflows: true,
            f: config.workflow_don.f,
            members: workflow_members.clone(),
            capability_configurations: Vec::new(),
        };
        let trigger_don = Don {
            id: DonId(config.trigger_don.id),
            is_public: true,
            accepts_workflows: false,
            f: config.trigger_don.f,
            members: trigger_members.clone(),
            capability_configurations: vec![CapabilityConfiguration {
                capability_id: trigger_capability.id(),
                config: Vec::new(),
            }],
        };

        let mut nodes: Vec<NodeInfo> = trigger_members
            .iter()
            .zip(&signers)
            .map(|(peer_id, signer)| NodeInfo {
                peer_id: *peer_id,
                signer: *signer,
            })
            .collect();
        for member in &workflow_members {
            if !trigger_members.contains(member) {
                nodes.push(NodeInfo {
                    peer_id: *member,
                    signer: [0u8; SIGNER_SIZE],
                });
            }
        }

        let static_peers = config
            .static_peers
            .iter()
            .map(|p| Ok((p.parse()?, StreamConfig::default())))
            .collect::<CoreResult<HashMap<_, _>>>()?;

        Ok(Self {
            static_peers,
            workflow_don,
            trigger_don,
            trigger_capability,
            nodes,
        })
    }

    /// The registry snapshot equivalent to this static description.
    pub fn initial_state(&self) -> RegistryState {
        RegistryState::new(
            vec![self.workflow_don.clone(), self.trigger_don.clone()],
            vec![self.trigger_capability.clone()],
            self.nodes.clone(),
        )
    }

    /// Identity of the configured bootstrap trigger capability.
    pub fn trigger_capability_id(&self) -> CapabilityId {
        self.trigger_capability.id()
    }
}
