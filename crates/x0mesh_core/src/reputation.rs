//! Per-peer reputation ledger.
//!
//! Scores live in [0,1], start neutral at 0.5 and move on protocol evidence:
//! valid traffic earns small rewards, signature and replay violations cost
//! much more. Idle peers decay exponentially back toward neutral. Peers
//! below the quarantine threshold are excluded from quorum counts until
//! they recover above the recovery bar after an hour of clean behavior.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ReputationConfig;
use crate::types::NodeId;

/// Neutral score assigned on discovery.
pub const NEUTRAL_SCORE: f32 = 0.5;

/// Score a quarantined peer must regain before reinstatement.
pub const RECOVERY_THRESHOLD: f32 = 0.4;

/// Clean-behavior interval required for reinstatement, milliseconds.
pub const RECOVERY_CLEAN_MS: u64 = 3_600_000;

/// Bound on the in-memory event log.
const EVENT_LOG_CAP: usize = 10_000;

/// Protocol evidence that moves a peer's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReputationEvent {
    ValidBeacon,
    ValidHandshake,
    InvalidSignature,
    ReplayDetected,
    MissedSlots,
    Equivocation,
    RateLimitExcess,
}

impl ReputationEvent {
    pub fn delta(self) -> f32 {
        match self {
            ReputationEvent::ValidBeacon => 0.01,
            ReputationEvent::ValidHandshake => 0.05,
            ReputationEvent::InvalidSignature => -0.2,
            ReputationEvent::ReplayDetected => -0.3,
            ReputationEvent::MissedSlots => -0.1,
            ReputationEvent::Equivocation => -0.5,
            ReputationEvent::RateLimitExcess => -0.01,
        }
    }

    fn is_penalty(self) -> bool {
        self.delta() < 0.0
    }
}

/// Append-only record of an applied event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub peer: NodeId,
    pub event: ReputationEvent,
    pub delta: f32,
    pub score_after: f32,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerScore {
    score: f32,
    /// Last time evidence (or decay) touched the score.
    updated_at_ms: u64,
    /// Last penalty; recovery requires an hour of clean behavior after it.
    last_penalty_at_ms: Option<u64>,
}

/// The ledger. Scores plus a bounded append-only event log, both
/// serializable for persistence across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationLedger {
    scores: BTreeMap<NodeId, PeerScore>,
    log: Vec<ReputationRecord>,
    #[serde(default)]
    config: ReputationConfig,
}

impl ReputationLedger {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            scores: BTreeMap::new(),
            log: Vec::new(),
            config,
        }
    }

    /// Current score with idle decay applied (read-only; decay is folded in
    /// lazily on the next mutation).
    pub fn score(&self, peer: &NodeId, now_ms: u64) -> f32 {
        match self.scores.get(peer) {
            Some(entry) => self.decayed(entry, now_ms),
            None => NEUTRAL_SCORE,
        }
    }

    fn decayed(&self, entry: &PeerScore, now_ms: u64) -> f32 {
        let elapsed_h = now_ms.saturating_sub(entry.updated_at_ms) as f32 / 3_600_000.0;
        if elapsed_h <= 0.0 {
            return entry.score;
        }
        let factor = (-self.config.decay_per_hour * elapsed_h).exp();
        NEUTRAL_SCORE + (entry.score - NEUTRAL_SCORE) * factor
    }

    /// Apply evidence and return the new score.
    pub fn record(&mut self, peer: NodeId, event: ReputationEvent, now_ms: u64) -> f32 {
        let decay_cfg = self.config.clone();
        let entry = self.scores.entry(peer).or_insert(PeerScore {
            score: NEUTRAL_SCORE,
            updated_at_ms: now_ms,
            last_penalty_at_ms: None,
        });

        // Fold in idle decay since the last touch before applying the delta.
        let elapsed_h = now_ms.saturating_sub(entry.updated_at_ms) as f32 / 3_600_000.0;
        if elapsed_h > 0.0 {
            let factor = (-decay_cfg.decay_per_hour * elapsed_h).exp();
            entry.score = NEUTRAL_SCORE + (entry.score - NEUTRAL_SCORE) * factor;
        }

        entry.score = (entry.score + event.delta()).clamp(0.0, 1.0);
        entry.updated_at_ms = now_ms;
        if event.is_penalty() {
            entry.last_penalty_at_ms = Some(now_ms);
        }
        let score_after = entry.score;

        self.log.push(ReputationRecord {
            peer,
            event,
            delta: event.delta(),
            score_after,
            at_ms: now_ms,
        });
        if self.log.len() > EVENT_LOG_CAP {
            let overflow = self.log.len() - EVENT_LOG_CAP;
            self.log.drain(..overflow);
        }

        score_after
    }

    /// Apply a raw delta (used for reason-scaled handshake penalties).
    pub fn adjust(&mut self, peer: NodeId, delta: f32, now_ms: u64) -> f32 {
        let entry = self.scores.entry(peer).or_insert(PeerScore {
            score: NEUTRAL_SCORE,
            updated_at_ms: now_ms,
            last_penalty_at_ms: None,
        });
        entry.score = (entry.score + delta).clamp(0.0, 1.0);
        entry.updated_at_ms = now_ms;
        if delta < 0.0 {
            entry.last_penalty_at_ms = Some(now_ms);
        }
        entry.score
    }

    /// Peer must be quarantined right now.
    pub fn should_quarantine(&self, peer: &NodeId, now_ms: u64) -> bool {
        self.score(peer, now_ms) < self.config.quarantine_threshold
    }

    /// A quarantined peer has recovered: above the recovery bar and clean
    /// (no penalties) for a full hour.
    pub fn has_recovered(&self, peer: &NodeId, now_ms: u64) -> bool {
        let Some(entry) = self.scores.get(peer) else {
            return false;
        };
        let clean = match entry.last_penalty_at_ms {
            Some(at) => now_ms.saturating_sub(at) >= RECOVERY_CLEAN_MS,
            None => true,
        };
        clean && self.decayed(entry, now_ms) > RECOVERY_THRESHOLD
    }

    /// Scores for every tracked peer, decayed to `now_ms`.
    pub fn snapshot(&self, now_ms: u64) -> BTreeMap<NodeId, f32> {
        self.scores
            .iter()
            .map(|(peer, entry)| (*peer, self.decayed(entry, now_ms)))
            .collect()
    }

    pub fn recent_events(&self, limit: usize) -> &[ReputationRecord] {
        let start = self.log.len().saturating_sub(limit);
        &self.log[start..]
    }

    pub fn quarantine_threshold(&self) -> f32 {
        self.config.quarantine_threshold
    }
}

impl Default for ReputationLedger {
    fn default() -> Self {
        Self::new(ReputationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = id;
        NodeId(bytes)
    }

    #[test]
    fn test_default_score_is_neutral() {
        let ledger = ReputationLedger::default();
        assert_eq!(ledger.score(&peer(1), 0), 0.5);
    }

    #[test]
    fn test_event_deltas() {
        let mut ledger = ReputationLedger::default();
        let p = peer(1);

        ledger.record(p, ReputationEvent::ValidBeacon, 0);
        assert!((ledger.score(&p, 0) - 0.51).abs() < 1e-6);

        ledger.record(p, ReputationEvent::ValidHandshake, 0);
        assert!((ledger.score(&p, 0) - 0.56).abs() < 1e-6);

        ledger.record(p, ReputationEvent::InvalidSignature, 0);
        assert!((ledger.score(&p, 0) - 0.36).abs() < 1e-6);
    }

    #[test]
    fn test_clamped_to_unit_interval() {
        let mut ledger = ReputationLedger::default();
        let p = peer(1);
        for _ in 0..5 {
            ledger.record(p, ReputationEvent::Equivocation, 0);
        }
        assert_eq!(ledger.score(&p, 0), 0.0);
        for _ in 0..200 {
            ledger.record(p, ReputationEvent::ValidHandshake, 0);
        }
        assert_eq!(ledger.score(&p, 0), 1.0);
    }

    #[test]
    fn test_quarantine_below_threshold() {
        let mut ledger = ReputationLedger::default();
        let p = peer(1);
        ledger.record(p, ReputationEvent::ValidHandshake, 0); // 0.55
        ledger.record(p, ReputationEvent::ReplayDetected, 0); // 0.25
        assert!(!ledger.should_quarantine(&p, 0));
        ledger.record(p, ReputationEvent::MissedSlots, 0); // 0.15
        assert!(ledger.should_quarantine(&p, 0));
    }

    #[test]
    fn test_idle_decay_toward_neutral() {
        let mut ledger = ReputationLedger::default();
        let p = peer(1);
        ledger.record(p, ReputationEvent::Equivocation, 0); // 0.0

        // After 10 idle hours the score has drifted noticeably toward 0.5.
        let ten_hours = 10 * 3_600_000;
        let decayed = ledger.score(&p, ten_hours);
        assert!(decayed > 0.1 && decayed < 0.5, "decayed = {decayed}");

        // Decay converges to neutral, never past it.
        let week = 7 * 24 * 3_600_000;
        let settled = ledger.score(&p, week);
        assert!(settled > 0.35 && settled <= 0.5);
    }

    #[test]
    fn test_recovery_needs_clean_hour_and_score() {
        let mut ledger = ReputationLedger::default();
        let p = peer(1);
        for _ in 0..4 {
            ledger.record(p, ReputationEvent::ReplayDetected, 0); // 0.0, quarantined
        }
        assert!(ledger.should_quarantine(&p, 0));
        assert!(!ledger.has_recovered(&p, 0));

        // Clean valid traffic, but less than an hour after the last penalty.
        for i in 0..40 {
            ledger.record(p, ReputationEvent::ValidBeacon, 1_000 + i);
        }
        assert!(!ledger.has_recovered(&p, 30 * 60_000));

        // Push the score above the bar, then let the clean hour pass.
        for i in 0..10 {
            ledger.record(p, ReputationEvent::ValidHandshake, 2_000 + i);
        }
        assert!(ledger.has_recovered(&p, 2_000 + RECOVERY_CLEAN_MS));
    }

    #[test]
    fn test_event_log_appends_and_bounds() {
        let mut ledger = ReputationLedger::default();
        let p = peer(1);
        ledger.record(p, ReputationEvent::ValidBeacon, 5);
        let events = ledger.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ReputationEvent::ValidBeacon);
        assert_eq!(events[0].at_ms, 5);
    }
}
