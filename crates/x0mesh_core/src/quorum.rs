//! Quorum validation for critical events.
//!
//! A node observing a critical event (peer-down, policy change, charter
//! violation) solicits attestations. Peers that independently corroborate
//! sign their own attestation; acceptance requires enough distinct
//! non-quarantined attesters, weighted by reputation, inside the deadline.
//! On timeout the event is downgraded to a local warning and triggers no
//! side effects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::QuorumConfig;
use crate::types::{NodeId, Slot};

/// Minimum attesters when the active neighborhood is small.
const SMALL_MESH_MIN_ATTESTERS: usize = 3;
/// Neighborhood size at or below which the small-mesh minimum applies.
const SMALL_MESH_LIMIT: usize = 4;

/// A critical event awaiting quorum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalEvent {
    pub id: [u8; 32],
    pub kind: String,
    pub origin: NodeId,
    pub opened_at_slot: Slot,
}

/// One peer's corroboration, already signature-verified by the gossip layer.
#[derive(Debug, Clone, Copy)]
pub struct Attestation {
    pub event_id: [u8; 32],
    pub attester: NodeId,
    pub slot: Slot,
}

/// Verdict for a pending event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumVerdict {
    /// Enough weighted attestations arrived in time; side effects proceed.
    Accepted { attesters: Vec<NodeId> },
    /// Deadline passed; the event is downgraded to a local warning.
    Downgraded,
}

#[derive(Debug)]
struct PendingQuorum {
    event: CriticalEvent,
    deadline_slot: Slot,
    /// Attester id → reputation at attestation time.
    attesters: HashMap<NodeId, f32>,
}

/// Collects attestations per event and evaluates the quorum rule.
pub struct QuorumValidator {
    config: QuorumConfig,
    pending: HashMap<[u8; 32], PendingQuorum>,
}

impl QuorumValidator {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Required distinct attesters for the given active neighborhood size.
    pub fn required_attesters(active_peers: usize) -> usize {
        if active_peers <= SMALL_MESH_LIMIT {
            SMALL_MESH_MIN_ATTESTERS
        } else {
            (2 * active_peers).div_ceil(3)
        }
    }

    /// Open an attestation window for a critical event.
    pub fn open(&mut self, event: CriticalEvent, now_slot: Slot) {
        let deadline_slot = now_slot + self.config.quorum_window_slots;
        debug!(event = %hex::encode(&event.id[..6]), kind = %event.kind, deadline_slot, "quorum window opened");
        self.pending.entry(event.id).or_insert(PendingQuorum {
            event,
            deadline_slot,
            attesters: HashMap::new(),
        });
    }

    pub fn is_pending(&self, event_id: &[u8; 32]) -> bool {
        self.pending.contains_key(event_id)
    }

    /// Record a corroborating attestation. Quarantined peers never count;
    /// duplicate attesters keep their first weight.
    pub fn on_attestation(
        &mut self,
        attestation: Attestation,
        attester_reputation: f32,
        attester_quarantined: bool,
    ) {
        if attester_quarantined {
            return;
        }
        let Some(pending) = self.pending.get_mut(&attestation.event_id) else {
            return;
        };
        if attestation.slot > pending.deadline_slot {
            return;
        }
        pending
            .attesters
            .entry(attestation.attester)
            .or_insert(attester_reputation);
    }

    /// Evaluate pending events: accept those that met quorum, downgrade
    /// those whose deadline passed. Call once per slot.
    pub fn evaluate(
        &mut self,
        now_slot: Slot,
        active_peers: usize,
    ) -> Vec<(CriticalEvent, QuorumVerdict)> {
        let threshold = self.config.reputation_quorum_threshold;
        let required = Self::required_attesters(active_peers);
        let mut decided = Vec::new();

        let ids: Vec<[u8; 32]> = self.pending.keys().copied().collect();
        for id in ids {
            let pending = &self.pending[&id];
            let weight: f32 = pending.attesters.values().sum();
            let met = pending.attesters.len() >= required && weight >= threshold;

            if met {
                let pending = self.pending.remove(&id).expect("key listed above");
                let attesters: Vec<NodeId> = pending.attesters.keys().copied().collect();
                info!(
                    event = %hex::encode(&id[..6]),
                    attesters = attesters.len(),
                    weight,
                    "quorum accepted"
                );
                decided.push((pending.event, QuorumVerdict::Accepted { attesters }));
            } else if now_slot > pending.deadline_slot {
                let pending = self.pending.remove(&id).expect("key listed above");
                info!(event = %hex::encode(&id[..6]), "quorum timeout, downgraded to local warning");
                decided.push((pending.event, QuorumVerdict::Downgraded));
            }
        }
        decided
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = id;
        NodeId(bytes)
    }

    fn event(id: u8) -> CriticalEvent {
        CriticalEvent {
            id: [id; 32],
            kind: "peer-down".into(),
            origin: node(1),
            opened_at_slot: 10,
        }
    }

    fn attest(event_id: u8, attester: u8, slot: Slot) -> Attestation {
        Attestation {
            event_id: [event_id; 32],
            attester: node(attester),
            slot,
        }
    }

    #[test]
    fn test_required_attesters_small_and_large() {
        assert_eq!(QuorumValidator::required_attesters(0), 3);
        assert_eq!(QuorumValidator::required_attesters(4), 3);
        assert_eq!(QuorumValidator::required_attesters(6), 4);
        assert_eq!(QuorumValidator::required_attesters(9), 6);
        assert_eq!(QuorumValidator::required_attesters(10), 7);
    }

    #[test]
    fn test_quorum_accepts_with_enough_weighted_attesters() {
        let mut q = QuorumValidator::new(QuorumConfig::default());
        q.open(event(1), 10);

        for attester in 2..5u8 {
            q.on_attestation(attest(1, attester, 11), 0.6, false);
        }
        let decided = q.evaluate(11, 4);
        assert_eq!(decided.len(), 1);
        assert!(matches!(decided[0].1, QuorumVerdict::Accepted { .. }));
        assert!(!q.is_pending(&[1u8; 32]));
    }

    #[test]
    fn test_quorum_timeout_downgrades() {
        let mut q = QuorumValidator::new(QuorumConfig::default());
        q.open(event(1), 10);
        q.on_attestation(attest(1, 2, 11), 0.9, false);

        assert!(q.evaluate(12, 4).is_empty()); // window still open
        let decided = q.evaluate(14, 4);
        assert_eq!(decided.len(), 1);
        assert_eq!(decided[0].1, QuorumVerdict::Downgraded);
    }

    #[test]
    fn test_reputation_weight_also_required() {
        let mut q = QuorumValidator::new(QuorumConfig::default());
        q.open(event(1), 10);

        // Three distinct attesters but total weight 0.9 < 1.5.
        for attester in 2..5u8 {
            q.on_attestation(attest(1, attester, 11), 0.3, false);
        }
        assert!(q.evaluate(11, 4).is_empty());

        // One more with strong reputation tips the weight over.
        q.on_attestation(attest(1, 5, 12), 0.9, false);
        let decided = q.evaluate(12, 4);
        assert!(matches!(decided[0].1, QuorumVerdict::Accepted { .. }));
    }

    #[test]
    fn test_quarantined_attesters_excluded() {
        let mut q = QuorumValidator::new(QuorumConfig::default());
        q.open(event(1), 10);

        for attester in 2..5u8 {
            q.on_attestation(attest(1, attester, 11), 0.9, true);
        }
        let decided = q.evaluate(14, 4);
        assert_eq!(decided[0].1, QuorumVerdict::Downgraded);
    }

    #[test]
    fn test_duplicate_attesters_counted_once() {
        let mut q = QuorumValidator::new(QuorumConfig::default());
        q.open(event(1), 10);

        for _ in 0..5 {
            q.on_attestation(attest(1, 2, 11), 0.9, false);
        }
        q.on_attestation(attest(1, 3, 11), 0.9, false);
        assert!(q.evaluate(11, 4).is_empty()); // only two distinct attesters
    }

    #[test]
    fn test_late_attestations_ignored() {
        let mut q = QuorumValidator::new(QuorumConfig::default());
        q.open(event(1), 10);
        // Past the deadline slot (10 + 3).
        q.on_attestation(attest(1, 2, 20), 0.9, false);
        q.on_attestation(attest(1, 3, 20), 0.9, false);
        q.on_attestation(attest(1, 4, 20), 0.9, false);
        let decided = q.evaluate(20, 4);
        assert_eq!(decided[0].1, QuorumVerdict::Downgraded);
    }

    #[test]
    fn test_byzantine_minority_cannot_force_quorum() {
        // 9 active peers → 6 required; 3 colluding attesters cannot reach it.
        let mut q = QuorumValidator::new(QuorumConfig::default());
        q.open(event(1), 10);
        for attester in 2..5u8 {
            q.on_attestation(attest(1, attester, 11), 1.0, false);
        }
        assert!(q.evaluate(11, 9).is_empty());
        let decided = q.evaluate(14, 9);
        assert_eq!(decided[0].1, QuorumVerdict::Downgraded);
    }
}
