//! TDMA beacon slot clock.
//!
//! Wall time divides into fixed slots; slot ownership is a deterministic
//! function of the slot index and the sorted active membership, so every
//! converged node agrees on who beacons when. Drift against the
//! neighborhood is measured per received beacon and corrected as a damped
//! median, which reconverges the slot clock within a couple of seconds
//! after a partition heals.

use std::collections::HashMap;

use tracing::debug;

use crate::types::{NodeId, Slot};

/// One advance of the slot clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTick {
    pub slot: Slot,
    /// This node owns the slot and should emit a beacon.
    pub ours: bool,
}

pub struct BeaconScheduler {
    local_id: NodeId,
    slot_ms: u64,
    drift_threshold_ms: u64,
    damping: f64,
    /// Accumulated clock correction applied to local wall time.
    correction_ms: i64,
    last_emitted_slot: Option<Slot>,
    /// Set when we lost an ownership tie-break; we skip our next owned slot.
    backoff_pending: bool,
    /// Most recent measured offset per neighbor.
    neighbor_offsets: HashMap<NodeId, i64>,
}

impl BeaconScheduler {
    pub fn new(local_id: NodeId, slot_ms: u64, drift_threshold_ms: u64, damping: f64) -> Self {
        Self {
            local_id,
            slot_ms: slot_ms.max(1),
            drift_threshold_ms,
            damping,
            correction_ms: 0,
            last_emitted_slot: None,
            backoff_pending: false,
            neighbor_offsets: HashMap::new(),
        }
    }

    pub fn slot_ms(&self) -> u64 {
        self.slot_ms
    }

    pub fn correction_ms(&self) -> i64 {
        self.correction_ms
    }

    /// Restore a persisted correction across restarts.
    pub fn set_correction_ms(&mut self, correction_ms: i64) {
        self.correction_ms = correction_ms;
    }

    fn corrected_now(&self, now_ms: u64) -> u64 {
        now_ms.saturating_add_signed(self.correction_ms)
    }

    pub fn current_slot(&self, now_ms: u64) -> Slot {
        self.corrected_now(now_ms) / self.slot_ms
    }

    /// Deterministic slot owner over the sorted membership (active peers
    /// plus self). An isolated node owns every slot.
    pub fn owner(&self, slot: Slot, active_peers: &[NodeId]) -> NodeId {
        let mut members: Vec<NodeId> = active_peers.to_vec();
        members.push(self.local_id);
        members.sort();
        members.dedup();
        members[(slot % members.len() as u64) as usize]
    }

    /// Advance the clock. Returns a tick when the slot index moved.
    pub fn on_tick(&mut self, now_ms: u64, active_peers: &[NodeId]) -> Option<SlotTick> {
        let slot = self.current_slot(now_ms);
        if self.last_emitted_slot == Some(slot) {
            return None;
        }
        self.last_emitted_slot = Some(slot);

        let mut ours = self.owner(slot, active_peers) == self.local_id;
        if ours && self.backoff_pending {
            self.backoff_pending = false;
            ours = false;
        }
        Some(SlotTick { slot, ours })
    }

    /// Record a neighbor's beacon and the implied clock offset. Returns the
    /// measured offset in milliseconds.
    pub fn on_beacon(&mut self, peer: NodeId, their_slot: Slot, now_ms: u64) -> i64 {
        let local = self.corrected_now(now_ms) as i64;
        let their_slot_start = (their_slot * self.slot_ms) as i64;
        let offset = their_slot_start - local;
        self.neighbor_offsets.insert(peer, offset);
        offset
    }

    /// A peer claimed a slot we also consider ours. Lower id wins; the
    /// loser skips its next owned slot.
    pub fn on_claim_conflict(&mut self, peer: NodeId) {
        if peer < self.local_id {
            debug!(peer = %peer, "lost beacon slot tie-break, backing off one slot");
            self.backoff_pending = true;
        }
    }

    pub fn forget_neighbor(&mut self, peer: &NodeId) {
        self.neighbor_offsets.remove(peer);
    }

    /// Apply a damped correction when the neighborhood median drift exceeds
    /// the threshold. Returns the applied correction, if any.
    pub fn apply_drift_correction(&mut self) -> Option<i64> {
        if self.neighbor_offsets.is_empty() {
            return None;
        }
        let mut offsets: Vec<i64> = self.neighbor_offsets.values().copied().collect();
        offsets.sort_unstable();
        let median = offsets[offsets.len() / 2];

        if median.unsigned_abs() <= self.drift_threshold_ms {
            return None;
        }
        let applied = (median as f64 * self.damping).round() as i64;
        self.correction_ms += applied;
        // Outstanding measurements shift with the clock they were taken on.
        for offset in self.neighbor_offsets.values_mut() {
            *offset -= applied;
        }
        debug!(median, applied, total = self.correction_ms, "applied clock correction");
        Some(applied)
    }
}
