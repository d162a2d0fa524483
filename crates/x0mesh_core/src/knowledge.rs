//! Outcome knowledge (the K in MAPE-K).
//!
//! Per (cause class, action kind) the recorder keeps outcome counts and
//! serves the best historical action by Wilson lower bound of the success
//! rate, with ε-greedy exploration so cold pairs still get tried. Storage
//! is behind the pluggable `KnowledgeStore`; the bundled store keeps counts
//! in memory and optionally persists them as JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::planner::{ActionKind, SuccessHints};

/// Observations per pair after which the estimate is considered stable.
pub const SATURATION_OBSERVATIONS: u32 = 30;

/// z for the 95% Wilson interval.
const WILSON_Z: f64 = 1.96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyResult {
    Success,
    Partial,
    Ineffective,
    Degradation,
    Unknown,
}

impl PolicyResult {
    pub fn label(self) -> &'static str {
        match self {
            PolicyResult::Success => "success",
            PolicyResult::Partial => "partial",
            PolicyResult::Ineffective => "ineffective",
            PolicyResult::Degradation => "degradation",
            PolicyResult::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub n_success: u32,
    pub n_partial: u32,
    pub n_ineffective: u32,
    pub n_degradation: u32,
}

impl OutcomeStats {
    pub fn observe(&mut self, result: PolicyResult) {
        match result {
            PolicyResult::Success => self.n_success += 1,
            PolicyResult::Partial => self.n_partial += 1,
            PolicyResult::Ineffective => self.n_ineffective += 1,
            PolicyResult::Degradation => self.n_degradation += 1,
            PolicyResult::Unknown => {}
        }
    }

    pub fn trials(&self) -> u32 {
        self.n_success + self.n_partial + self.n_ineffective + self.n_degradation
    }

    pub fn is_stable(&self) -> bool {
        self.trials() >= SATURATION_OBSERVATIONS
    }

    /// Wilson score lower bound on the success rate.
    pub fn wilson_lower_bound(&self) -> f64 {
        let n = self.trials() as f64;
        if n == 0.0 {
            return 0.0;
        }
        let p = self.n_success as f64 / n;
        let z2 = WILSON_Z * WILSON_Z;
        let denom = 1.0 + z2 / n;
        let center = p + z2 / (2.0 * n);
        let margin = WILSON_Z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
        ((center - margin) / denom).max(0.0)
    }

    /// Laplace-smoothed success estimate; 0.5 with no observations.
    pub fn smoothed_success(&self) -> f64 {
        (self.n_success as f64 + 1.0) / (self.trials() as f64 + 2.0)
    }
}

/// Pluggable storage contract; the embedding process may substitute a
/// durable implementation.
pub trait KnowledgeStore: Send + Sync {
    fn record(&mut self, cause_class: &str, action: ActionKind, result: PolicyResult);
    fn stats(&self, cause_class: &str, action: ActionKind) -> OutcomeStats;
    fn actions_for(&self, cause_class: &str) -> Vec<(ActionKind, OutcomeStats)>;
    fn flush(&mut self) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    cause_class: String,
    action: ActionKind,
    stats: OutcomeStats,
}

/// In-memory store with optional JSON persistence.
#[derive(Default)]
pub struct MemoryKnowledgeStore {
    entries: BTreeMap<(String, ActionKind), OutcomeStats>,
    path: Option<PathBuf>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path` if present; subsequent flushes write back to it.
    pub fn with_path(path: PathBuf) -> Self {
        let mut store = Self {
            entries: BTreeMap::new(),
            path: Some(path.clone()),
        };
        if path.exists() {
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<Vec<StoredEntry>>(&s).map_err(|e| e.to_string()))
            {
                Ok(entries) => {
                    for e in entries {
                        store.entries.insert((e.cause_class, e.action), e.stats);
                    }
                }
                Err(e) => warn!(error = %e, "knowledge file unreadable, starting empty"),
            }
        }
        store
    }
}

impl KnowledgeStore for MemoryKnowledgeStore {
    fn record(&mut self, cause_class: &str, action: ActionKind, result: PolicyResult) {
        self.entries
            .entry((cause_class.to_string(), action))
            .or_default()
            .observe(result);
    }

    fn stats(&self, cause_class: &str, action: ActionKind) -> OutcomeStats {
        self.entries
            .get(&(cause_class.to_string(), action))
            .copied()
            .unwrap_or_default()
    }

    fn actions_for(&self, cause_class: &str) -> Vec<(ActionKind, OutcomeStats)> {
        self.entries
            .iter()
            .filter(|((class, _), _)| class == cause_class)
            .map(|((_, action), stats)| (*action, *stats))
            .collect()
    }

    fn flush(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        let entries: Vec<StoredEntry> = self
            .entries
            .iter()
            .map(|((cause_class, action), stats)| StoredEntry {
                cause_class: cause_class.clone(),
                action: *action,
                stats: *stats,
            })
            .collect();
        match serde_json::to_string_pretty(&entries) {
            Ok(json) => {
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::write(path, json) {
                    warn!(error = %e, "failed to persist knowledge");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize knowledge"),
        }
    }
}

/// Records outcomes and serves best-action hints to the planner.
pub struct KnowledgeRecorder {
    store: Box<dyn KnowledgeStore>,
    epsilon: f64,
}

impl KnowledgeRecorder {
    pub fn new(store: Box<dyn KnowledgeStore>, epsilon: f64) -> Self {
        Self { store, epsilon }
    }

    pub fn record(&mut self, cause_class: &str, actions: &[ActionKind], result: PolicyResult) {
        for action in actions {
            self.store.record(cause_class, *action, result);
        }
    }

    pub fn stats(&self, cause_class: &str, action: ActionKind) -> OutcomeStats {
        self.store.stats(cause_class, action)
    }

    /// Best action by Wilson lower bound; with probability ε an arbitrary
    /// known action is explored instead.
    pub fn best_action_for<R: Rng>(&self, cause_class: &str, rng: &mut R) -> Option<ActionKind> {
        let known = self.store.actions_for(cause_class);
        if known.is_empty() {
            return None;
        }
        if rng.gen::<f64>() < self.epsilon {
            let idx = rng.gen_range(0..known.len());
            return Some(known[idx].0);
        }
        known
            .into_iter()
            .max_by(|(_, a), (_, b)| a.wilson_lower_bound().total_cmp(&b.wilson_lower_bound()))
            .map(|(action, _)| action)
    }

    pub fn flush(&mut self) {
        self.store.flush();
    }
}

impl SuccessHints for KnowledgeRecorder {
    fn success_estimate(&self, cause_class: &str, action: ActionKind) -> f64 {
        self.store.stats(cause_class, action).smoothed_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const CLASS: &str = "temporal-burst:high-latency";

    fn recorder(epsilon: f64) -> KnowledgeRecorder {
        KnowledgeRecorder::new(Box::new(MemoryKnowledgeStore::new()), epsilon)
    }

    #[test]
    fn test_wilson_bound_monotone_in_evidence() {
        let few = OutcomeStats {
            n_success: 2,
            ..Default::default()
        };
        let many = OutcomeStats {
            n_success: 20,
            ..Default::default()
        };

        // Same 100% rate, but more evidence tightens the bound upward.
        assert!(many.wilson_lower_bound() > few.wilson_lower_bound());
        assert!(few.wilson_lower_bound() > 0.0);
    }

    #[test]
    fn test_smoothed_success_defaults_to_half() {
        assert_eq!(OutcomeStats::default().smoothed_success(), 0.5);
    }

    #[test]
    fn test_best_action_prefers_strong_history() {
        let mut rec = recorder(0.0);
        for _ in 0..20 {
            rec.record(CLASS, &[ActionKind::ThrottleRequests], PolicyResult::Success);
            rec.record(CLASS, &[ActionKind::RestartService], PolicyResult::Ineffective);
        }
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            rec.best_action_for(CLASS, &mut rng),
            Some(ActionKind::ThrottleRequests)
        );
    }

    #[test]
    fn test_best_action_converges_after_saturation() {
        let mut rec = recorder(0.0);
        for i in 0..40 {
            rec.record(
                CLASS,
                &[ActionKind::ThrottleRequests],
                if i % 10 == 0 {
                    PolicyResult::Partial
                } else {
                    PolicyResult::Success
                },
            );
            rec.record(
                CLASS,
                &[ActionKind::ScaleUp],
                if i % 2 == 0 {
                    PolicyResult::Success
                } else {
                    PolicyResult::Degradation
                },
            );
        }
        assert!(rec.stats(CLASS, ActionKind::ThrottleRequests).is_stable());
        assert!(rec.stats(CLASS, ActionKind::ScaleUp).is_stable());

        // Converged: repeated calls agree on the higher-bound action.
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10 {
            assert_eq!(
                rec.best_action_for(CLASS, &mut rng),
                Some(ActionKind::ThrottleRequests)
            );
        }
    }

    #[test]
    fn test_epsilon_explores_sometimes() {
        let mut rec = recorder(1.0); // always explore
        rec.record(CLASS, &[ActionKind::ThrottleRequests], PolicyResult::Success);
        rec.record(CLASS, &[ActionKind::RestartService], PolicyResult::Ineffective);

        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..50 {
            seen.insert(rec.best_action_for(CLASS, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_unknown_class_has_no_best_action() {
        let rec = recorder(0.1);
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(rec.best_action_for("nothing", &mut rng), None);
    }

    #[test]
    fn test_success_estimate_tracks_outcomes() {
        let mut rec = recorder(0.0);
        for _ in 0..8 {
            rec.record(CLASS, &[ActionKind::ThrottleRequests], PolicyResult::Success);
        }
        rec.record(CLASS, &[ActionKind::ThrottleRequests], PolicyResult::Ineffective);
        let est = rec.success_estimate(CLASS, ActionKind::ThrottleRequests);
        assert!(est > 0.7 && est < 1.0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge.json");

        let mut store = MemoryKnowledgeStore::with_path(path.clone());
        store.record(CLASS, ActionKind::ThrottleRequests, PolicyResult::Success);
        store.flush();

        let reloaded = MemoryKnowledgeStore::with_path(path);
        assert_eq!(
            reloaded.stats(CLASS, ActionKind::ThrottleRequests).n_success,
            1
        );
    }
}
