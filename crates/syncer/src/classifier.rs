//! DON role classification.

use capmesh_core::{Don, PeerId, RegistryState};

/// The node's role relative to every public DON in a snapshot.
///
/// The workflow and capability checks are independent: a DON that both
/// accepts workflows and hosts capabilities lands in two buckets.
#[derive(Debug, Clone, Default)]
pub struct DonClassification {
    /// Workflow DONs this node is a member of.
    pub my_workflow_dons: Vec<Don>,
    /// Workflow DONs this node is not a member of.
    pub remote_workflow_dons: Vec<Don>,
    /// Capability-hosting DONs this node is a member of.
    pub my_capability_dons: Vec<Don>,
    /// Capability-hosting DONs this node is not a member of.
    pub remote_capability_dons: Vec<Don>,
}

/// Partitions the snapshot's public DONs by this node's membership and the
/// DON's role. Non-public DONs are ignored entirely.
pub fn classify(state: &RegistryState, my_id: &PeerId) -> DonClassification {
    let mut classification = DonClassification::default();

    for don in state.dons() {
        if !don.is_public {
            continue;
        }
        let mine = don.has_member(my_id);

        if don.accepts_workflows {
            if mine {
                classification.my_workflow_dons.push(don.clone());
            } else {
                classification.remote_workflow_dons.push(don.clone());
            }
        }

        if !don.capability_configurations.is_empty() {
            if mine {
                classification.my_capability_dons.push(don.clone());
            } else {
                classification.remote_capability_dons.push(don.clone());
            }
        }
    }

    classification
}
