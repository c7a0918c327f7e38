//! Registry snapshot reads.
//!
//! [`RemoteRegistryReader`] assembles a [`RegistryState`] from three
//! independent contract reads. The reads are not atomic with respect to
//! on-chain changes; any read failure aborts the whole snapshot, and no
//! partial state is ever returned.

use std::sync::Arc;

use async_trait::async_trait;
use capmesh_core::{Capability, CapabilityType, Don, DonId, NodeInfo, RegistryState, Word32};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

/// Errors from snapshot assembly.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("contract read {method} on {contract} failed: {reason}")]
    Contract {
        contract: String,
        method: &'static str,
        reason: String,
    },

    #[error("invalid registry state: {0}")]
    InvalidState(String),
}

/// A capability row as returned by the contract, before structural
/// validation.
#[derive(Debug, Clone)]
pub struct RawCapability {
    pub labelled_name: [u8; 32],
    pub version: [u8; 32],
    pub capability_type: u8,
    pub response_type: u8,
}

impl RawCapability {
    fn validate(&self) -> Result<Capability, ReadError> {
        let labelled_name = Word32::try_from_bytes(self.labelled_name)
            .map_err(|e| ReadError::InvalidState(format!("capability labelled name: {e}")))?;
        let version = Word32::try_from_bytes(self.version)
            .map_err(|e| ReadError::InvalidState(format!("capability version: {e}")))?;
        let capability_type = CapabilityType::try_from(self.capability_type)
            .map_err(|e| ReadError::InvalidState(e.to_string()))?;
        Ok(Capability {
            labelled_name,
            version,
            capability_type,
            response_type: self.response_type,
        })
    }
}

/// The registry contract's read surface, reached through a generic
/// contract-reader bound to a named, addressed contract instance.
#[async_trait]
pub trait RegistryContract: Send + Sync {
    async fn get_dons(&self) -> Result<Vec<Don>, ReadError>;
    async fn get_capabilities(&self) -> Result<Vec<RawCapability>, ReadError>;
    async fn get_nodes(&self) -> Result<Vec<NodeInfo>, ReadError>;
}

/// Name and address of the contract instance a reader is bound to.
#[derive(Debug, Clone)]
pub struct BoundContract {
    pub name: String,
    pub address: String,
}

/// Produces point-in-time registry snapshots.
#[async_trait]
pub trait StateReader: Send + Sync {
    async fn state(&self) -> Result<RegistryState, ReadError>;
}

/// [`StateReader`] over a live registry contract.
pub struct RemoteRegistryReader {
    contract: Arc<dyn RegistryContract>,
    binding: BoundContract,
}

impl RemoteRegistryReader {
    pub fn new(contract: Arc<dyn RegistryContract>, binding: BoundContract) -> Self {
        Self { contract, binding }
    }
}

#[async_trait]
impl StateReader for RemoteRegistryReader {
    async fn state(&self) -> Result<RegistryState, ReadError> {
        let dons = self.contract.get_dons().await?;
        let raw_capabilities = self.contract.get_capabilities().await?;
        let nodes = self.contract.get_nodes().await?;

        let capabilities = raw_capabilities
            .iter()
            .map(RawCapability::validate)
            .collect::<Result<Vec<_>, _>>()?;

        for don in &dons {
            if don.is_public && don.members.is_empty() {
                return Err(ReadError::InvalidState(format!(
                    "public don {} has no members",
                    don.id
                )));
            }
        }

        debug!(
            contract = %self.binding.name,
            address = %self.binding.address,
            dons = dons.len(),
            capabilities = capabilities.len(),
            nodes = nodes.len(),
            "registry snapshot read"
        );
        Ok(RegistryState::new(dons, capabilities, nodes))
    }
}

#[derive(Default)]
struct SimulatedState {
    dons: Vec<Don>,
    capabilities: Vec<RawCapability>,
    nodes: Vec<NodeInfo>,
    fail_reads: bool,
}

/// In-memory [`RegistryContract`] for tests and dev-mode wiring; contents
/// can be mutated between ticks to simulate on-chain topology changes.
#[derive(Default)]
pub struct SimulatedRegistryContract {
    state: RwLock<SimulatedState>,
}

impl SimulatedRegistryContract {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the contract from an assembled snapshot.
    pub fn seed(&self, state: &RegistryState) {
        let mut inner = self.state.write();
        inner.dons = state.dons().to_vec();
        inner.capabilities = state
            .capabilities()
            .iter()
            .map(|c| RawCapability {
                labelled_name: *c.labelled_name.as_bytes(),
                version: *c.version.as_bytes(),
                capability_type: c.capability_type.tag(),
                response_type: c.response_type,
            })
            .collect();
        inner.nodes = state.nodes().to_vec();
    }

    pub fn set_dons(&self, dons: Vec<Don>) {
        self.state.write().dons = dons;
    }

    pub fn remove_don(&self, id: DonId) {
        self.state.write().dons.retain(|d| d.id != id);
    }

    pub fn set_capabilities(&self, capabilities: Vec<RawCapability>) {
        self.state.write().capabilities = capabilities;
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.state.write().nodes = nodes;
    }

    /// Makes every subsequent read fail, until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.write().fail_reads = fail;
    }

    fn check(&self, method: &'static str) -> Result<(), ReadError> {
        if self.state.read().fail_reads {
            return Err(ReadError::Contract {
                contract: "capability_registry".to_string(),
                method,
                reason: "simulated read failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryContract for SimulatedRegistryContract {
    async fn get_dons(&self) -> Result<Vec<Don>, ReadError> {
        self.check("getDONs")?;
        Ok(self.state.read().dons.clone())
    }

    async fn get_capabilities(&self) -> Result<Vec<RawCapability>, ReadError> {
        self.check("getCapabilities")?;
        Ok(self.state.read().capabilities.clone())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>, ReadError> {
        self.check("getNodes")?;
        Ok(self.state.read().nodes.clone())
    }
}
