//! Peer table and lifecycle state machine.
//!
//! Peers are owned here; other components refer to them by `NodeId` and the
//! control plane reads copy-on-read snapshots. All mutations happen on the
//! network plane task.
//!
//! ```text
//! Unknown → Discovered (first valid beacon)
//! Discovered → Handshaking → Active
//! Active → Degraded (≥3 missed beacons or reputation in [0.2, 0.4))
//! Degraded → Active (reputation ≥ 0.5 for ≥60s of valid traffic)
//! Degraded → Gone (≥10 consecutive missed slots)
//! Active/Degraded → Quarantined (reputation < 0.2 or quorum-attested)
//! Quarantined → Gone (quarantine TTL)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::pqc::{KemPublicKey, SigPublicKey};
use crate::reputation::ReputationLedger;
use crate::session::{RecvWindow, Session};
use crate::types::{blake2b256, NodeId, Slot};

/// Missed consecutive beacons before an Active peer degrades.
pub const DEGRADE_MISSED_BEACONS: u32 = 3;
/// Missed consecutive slots before a Degraded peer is considered gone.
pub const GONE_MISSED_SLOTS: u32 = 10;
/// Reputation bar for Degraded → Active recovery.
pub const REINSTATE_SCORE: f32 = 0.5;
/// Valid-traffic interval required for Degraded → Active, milliseconds.
pub const REINSTATE_CLEAN_MS: u64 = 60_000;
/// Slots a Gone peer lingers before removal.
pub const GONE_GRACE_SLOTS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Unknown,
    Discovered,
    Handshaking,
    Active,
    Degraded,
    Quarantined,
    Gone,
}

/// Everything known about one peer.
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: PeerState,
    pub last_seen_slot: Slot,
    pub drift_ms: i64,
    pub epoch_seen: u64,
    /// Epoch announced by a pending rotation; epoch+1 frames are accepted
    /// only when this is set.
    pub pending_epoch: Option<u64>,
    pub sig_public: Option<SigPublicKey>,
    pub classical_public: Option<[u8; 32]>,
    pub kem_public: Option<KemPublicKey>,
    pub session: Option<Session>,
    pub recv_window: RecvWindow,
    pub missed_beacons: u32,
    /// Slot of the transition into the current state.
    pub state_since_slot: Slot,
    /// Wall time valid traffic has been flowing since (degraded recovery).
    pub clean_since_ms: Option<u64>,
    pub quarantined_at_ms: Option<u64>,
    /// Control messages seen in the current slot (rate limiting).
    pub msgs_this_slot: u32,
}

impl Peer {
    fn new(id: NodeId, addr: SocketAddr, slot: Slot) -> Self {
        Self {
            id,
            addr,
            state: PeerState::Unknown,
            last_seen_slot: slot,
            drift_ms: 0,
            epoch_seen: 0,
            pending_epoch: None,
            sig_public: None,
            classical_public: None,
            kem_public: None,
            session: None,
            recv_window: RecvWindow::new(),
            missed_beacons: 0,
            state_since_slot: slot,
            clean_since_ms: None,
            quarantined_at_ms: None,
            msgs_this_slot: 0,
        }
    }

    fn transition(&mut self, to: PeerState, slot: Slot) {
        if self.state == to {
            return;
        }
        debug!(peer = %self.id, from = ?self.state, to = ?to, slot, "peer state transition");
        self.state = to;
        self.state_since_slot = slot;
    }
}

/// Read-only view of a peer for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: PeerState,
    pub reputation: f32,
    pub last_seen_slot: Slot,
    pub drift_ms: i64,
    pub has_session: bool,
}

pub struct PeerTable {
    local_id: NodeId,
    peers: HashMap<NodeId, Peer>,
    quarantine_ttl_ms: u64,
}

impl PeerTable {
    pub fn new(local_id: NodeId, quarantine_ttl_ms: u64) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            quarantine_ttl_ms,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Pre-register a trusted peer from configuration with its signing keys.
    pub fn register_trusted(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        sig_public: SigPublicKey,
        classical_public: Option<[u8; 32]>,
    ) {
        let peer = self.peers.entry(id).or_insert_with(|| Peer::new(id, addr, 0));
        peer.sig_public = Some(sig_public);
        peer.classical_public = classical_public;
        peer.addr = addr;
        info!(peer = %id, "registered trusted peer");
    }

    /// First valid beacon creates or revives the peer as Discovered.
    pub fn observe_beacon(&mut self, id: NodeId, addr: SocketAddr, epoch: u64, slot: Slot) {
        let peer = self
            .peers
            .entry(id)
            .or_insert_with(|| Peer::new(id, addr, slot));
        peer.addr = addr;
        peer.last_seen_slot = slot;
        peer.missed_beacons = 0;
        if peer.epoch_seen == 0 {
            peer.epoch_seen = epoch;
        }
        match peer.state {
            PeerState::Unknown | PeerState::Gone => peer.transition(PeerState::Discovered, slot),
            _ => {}
        }
    }

    pub fn begin_handshake(&mut self, id: &NodeId, slot: Slot) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        match peer.state {
            PeerState::Discovered => {
                peer.transition(PeerState::Handshaking, slot);
                true
            }
            _ => false,
        }
    }

    /// Initiator-side completion: the negotiated session becomes the
    /// channel session for this peer.
    pub fn handshake_complete(&mut self, id: &NodeId, session: Session, slot: Slot) {
        if let Some(peer) = self.peers.get_mut(id) {
            if let Some(mut old) = peer.session.replace(session) {
                old.destroy();
            }
            peer.transition(PeerState::Active, slot);
        }
    }

    /// Responder-side completion: both directions handshake, so a session
    /// negotiated by our own initiation takes precedence and is kept.
    pub fn handshake_complete_passive(&mut self, id: &NodeId, session: Session, slot: Slot) {
        if let Some(peer) = self.peers.get_mut(id) {
            if peer.session.is_none() {
                peer.session = Some(session);
            }
            peer.transition(PeerState::Active, slot);
        }
    }

    pub fn handshake_failed(&mut self, id: &NodeId, slot: Slot) {
        if let Some(peer) = self.peers.get_mut(id) {
            if peer.state == PeerState::Handshaking {
                peer.transition(PeerState::Discovered, slot);
            }
        }
    }

    /// Record that an expected beacon did not arrive.
    pub fn record_missed_beacon(&mut self, id: &NodeId, slot: Slot) {
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        peer.missed_beacons += 1;
        match peer.state {
            PeerState::Active if peer.missed_beacons >= DEGRADE_MISSED_BEACONS => {
                warn!(peer = %id, missed = peer.missed_beacons, "peer degraded, missed beacons");
                peer.clean_since_ms = None;
                peer.transition(PeerState::Degraded, slot);
            }
            PeerState::Degraded if peer.missed_beacons >= GONE_MISSED_SLOTS => {
                if let Some(mut session) = peer.session.take() {
                    session.destroy();
                }
                peer.transition(PeerState::Gone, slot);
            }
            _ => {}
        }
    }

    /// Record valid traffic (for Degraded → Active recovery tracking).
    pub fn record_valid_traffic(&mut self, id: &NodeId, now_ms: u64, slot: Slot) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_seen_slot = slot;
            if peer.clean_since_ms.is_none() {
                peer.clean_since_ms = Some(now_ms);
            }
        }
    }

    pub fn quarantine(&mut self, id: &NodeId, now_ms: u64, slot: Slot) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        match peer.state {
            PeerState::Active | PeerState::Degraded | PeerState::Handshaking => {
                if let Some(mut session) = peer.session.take() {
                    session.destroy();
                }
                peer.quarantined_at_ms = Some(now_ms);
                peer.transition(PeerState::Quarantined, slot);
                true
            }
            _ => false,
        }
    }

    /// Reverse a quarantine that was applied and then rolled back.
    pub fn lift_quarantine(&mut self, id: &NodeId, slot: Slot) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        if peer.state == PeerState::Quarantined {
            peer.quarantined_at_ms = None;
            peer.transition(PeerState::Active, slot);
            true
        } else {
            false
        }
    }

    /// Periodic maintenance: degraded recovery, reputation-driven
    /// quarantine, quarantine TTL expiry and Gone cleanup.
    pub fn tick_maintenance(&mut self, ledger: &ReputationLedger, now_ms: u64, slot: Slot) {
        let threshold = ledger.quarantine_threshold();
        let mut to_remove = Vec::new();

        for (id, peer) in self.peers.iter_mut() {
            let score = ledger.score(id, now_ms);
            match peer.state {
                PeerState::Active => {
                    if score < threshold {
                        if let Some(mut session) = peer.session.take() {
                            session.destroy();
                        }
                        warn!(peer = %id, score, "peer quarantined, reputation below threshold");
                        peer.quarantined_at_ms = Some(now_ms);
                        peer.transition(PeerState::Quarantined, slot);
                    } else if score < 0.4 {
                        peer.clean_since_ms = None;
                        peer.transition(PeerState::Degraded, slot);
                    }
                }
                PeerState::Degraded => {
                    if score < threshold {
                        if let Some(mut session) = peer.session.take() {
                            session.destroy();
                        }
                        peer.quarantined_at_ms = Some(now_ms);
                        peer.transition(PeerState::Quarantined, slot);
                    } else if score >= REINSTATE_SCORE {
                        let clean_long_enough = peer
                            .clean_since_ms
                            .is_some_and(|since| now_ms.saturating_sub(since) >= REINSTATE_CLEAN_MS);
                        if clean_long_enough {
                            info!(peer = %id, score, "peer reinstated");
                            peer.missed_beacons = 0;
                            peer.transition(PeerState::Active, slot);
                        }
                    }
                }
                PeerState::Quarantined => {
                    let expired = peer
                        .quarantined_at_ms
                        .is_some_and(|at| now_ms.saturating_sub(at) >= self.quarantine_ttl_ms);
                    if expired {
                        peer.transition(PeerState::Gone, slot);
                    } else if ledger.has_recovered(id, now_ms) {
                        info!(peer = %id, "quarantined peer recovered");
                        peer.quarantined_at_ms = None;
                        peer.transition(PeerState::Active, slot);
                    }
                }
                PeerState::Gone => {
                    if slot.saturating_sub(peer.state_since_slot) >= GONE_GRACE_SLOTS {
                        to_remove.push(*id);
                    }
                }
                _ => {}
            }
        }

        for id in to_remove {
            debug!(peer = %id, "removing gone peer after grace period");
            self.peers.remove(&id);
        }
    }

    /// Reset per-slot rate counters; call at each slot boundary.
    pub fn reset_slot_counters(&mut self) {
        for peer in self.peers.values_mut() {
            peer.msgs_this_slot = 0;
        }
    }

    pub fn active_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Active)
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn count_in_state(&self, state: PeerState) -> usize {
        self.peers.values().filter(|p| p.state == state).count()
    }

    /// BLAKE2b-256 over the sorted active peer ids (beacon neighbor digest).
    pub fn neighbor_digest(&self) -> [u8; 32] {
        let ids = self.active_ids();
        let parts: Vec<&[u8]> = ids.iter().map(|id| id.as_bytes().as_slice()).collect();
        blake2b256(&parts)
    }

    /// Copy-on-read view for the control plane.
    pub fn snapshot(&self, ledger: &ReputationLedger, now_ms: u64) -> Vec<PeerSnapshot> {
        self.peers
            .values()
            .map(|p| PeerSnapshot {
                id: p.id,
                addr: p.addr,
                state: p.state,
                reputation: ledger.score(&p.id, now_ms),
                last_seen_slot: p.last_seen_slot,
                drift_ms: p.drift_ms,
                has_session: p.session.is_some(),
            })
            .collect()
    }

    /// Destroy every session (shutdown path zeroizes secrets).
    pub fn destroy_all_sessions(&mut self) {
        for peer in self.peers.values_mut() {
            if let Some(mut session) = peer.session.take() {
                session.destroy();
            }
        }
    }
}
