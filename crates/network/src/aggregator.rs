//! Signed-response aggregation for remote trigger events.

use std::collections::{HashMap, HashSet};

use capmesh_core::{TriggerEvent, SIGNER_SIZE};
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};
use crate::message::SignedTriggerEvent;

/// Aggregates signed trigger events from a DON's members, accepting an event
/// once a quorum of distinct, known signers has reported an identical
/// payload.
///
/// One vote per signer: repeated reports from the same signer do not advance
/// the count, and reports from signers outside the allowed set are ignored.
pub struct SignedAggregator {
    signers: HashSet<[u8; SIGNER_SIZE]>,
    min_required: usize,
}

impl SignedAggregator {
    /// `min_required` is the DON's quorum, `f + 1`.
    pub fn new(signers: Vec<[u8; SIGNER_SIZE]>, min_required: usize) -> Self {
        Self {
            signers: signers.into_iter().collect(),
            min_required,
        }
    }

    /// Number of matching signed responses required to accept an event.
    pub fn min_required(&self) -> usize {
        self.min_required
    }

    /// Attempts to produce an accepted event from the responses collected so
    /// far for one event occurrence.
    pub fn aggregate(&self, responses: &[SignedTriggerEvent]) -> NetworkResult<TriggerEvent> {
        // payload -> distinct signers that reported it
        let mut votes: HashMap<&TriggerEvent, HashSet<[u8; SIGNER_SIZE]>> = HashMap::new();
        for response in responses {
            if !self.signers.contains(&response.signer) {
                debug!(
                    signer = %hex::encode(response.signer),
                    "ignoring response from signer outside the DON's signer set"
                );
                continue;
            }
            votes
                .entry(&response.event)
                .or_default()
                .insert(response.signer);
        }

        let mut best = 0;
        for (event, signers) in votes {
            if signers.len() >= self.min_required {
                return Ok(event.clone());
            }
            best = best.max(signers.len());
        }
        Err(NetworkError::QuorumNotReached {
            got: best,
            need: self.min_required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(tag: u8) -> [u8; SIGNER_SIZE] {
        [tag; SIGNER_SIZE]
    }

    fn event(payload: &[u8]) -> TriggerEvent {
        TriggerEvent {
            event_id: "occurrence-1".to_string(),
            payload: payload.to_vec(),
        }
    }

    fn signed(tag: u8, payload: &[u8]) -> SignedTriggerEvent {
        SignedTriggerEvent {
            event: event(payload),
            signer: signer(tag),
        }
    }

    fn aggregator(f: u8) -> SignedAggregator {
        SignedAggregator::new(vec![signer(1), signer(2), signer(3), signer(4)], f as usize + 1)
    }

    #[test]
    fn accepts_at_quorum() {
        let agg = aggregator(2);
        assert_eq!(agg.min_required(), 3);

        let responses = vec![signed(1, b"px"), signed(2, b"px"), signed(3, b"px")];
        let accepted = agg.aggregate(&responses).expect("quorum met");
        assert_eq!(accepted.payload, b"px");
    }

    #[test]
    fn below_quorum_is_rejected() {
        let agg = aggregator(2);
        let responses = vec![signed(1, b"px"), signed(2, b"px")];
        let err = agg.aggregate(&responses).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::QuorumNotReached { got: 2, need: 3 }
        ));
    }

    #[test]
    fn one_vote_per_signer() {
        let agg = aggregator(2);
        let responses = vec![signed(1, b"px"), signed(1, b"px"), signed(1, b"px")];
        assert!(agg.aggregate(&responses).is_err());
    }

    #[test]
    fn unknown_signers_are_ignored() {
        let agg = aggregator(1);
        let responses = vec![signed(9, b"px"), signed(8, b"px"), signed(1, b"px")];
        assert!(agg.aggregate(&responses).is_err());
    }

    #[test]
    fn diverging_payloads_do_not_combine() {
        let agg = aggregator(1);
        let responses = vec![signed(1, b"px"), signed(2, b"py")];
        assert!(agg.aggregate(&responses).is_err());

        let responses = vec![signed(1, b"px"), signed(2, b"py"), signed(3, b"px")];
        let accepted = agg.aggregate(&responses).expect("px reaches quorum");
        assert_eq!(accepted.payload, b"px");
    }
}
