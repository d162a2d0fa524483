//! Remediation planning (Plan phase).
//!
//! Candidate policies come from a typed action catalog filtered by
//! violation kind, scored by cost/benefit, the risk of acting against a
//! reputable peer, and the historical success of the (cause, action) pair.
//! Actions against peers above the trust bar, and quarantines always,
//! require quorum approval before execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analyzer::{Severity, Violation};
use crate::types::{blake2b256, NodeId};

/// Violations considered per planning pass.
pub const PLAN_TOP_K_VIOLATIONS: usize = 5;
/// Policies emitted per planning pass.
pub const PLAN_TOP_N_POLICIES: usize = 3;

/// Utility weights.
const W_BENEFIT: f64 = 1.0;
const W_COST: f64 = 0.5;
const W_RISK: f64 = 0.8;
const W_HISTORY: f64 = 0.6;

/// Reputation above which acting on a peer needs quorum approval.
const TRUSTED_PEER_BAR: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemediationAction {
    ScaleUp { component: String, delta: u32 },
    ScaleDown { component: String, delta: u32 },
    RestartService { target: String },
    ApplyPolicy { policy_id: String },
    ThrottleRequests { target: String, rate_pct: u8 },
    ActivateFallback { reason: String, ttl_secs: u64 },
    RebalanceLoad { from: String, to: String, share: f64 },
    UpdateConfiguration { key: String, value: String, scope: String },
    Quarantine { peer: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionKind {
    ScaleUp,
    ScaleDown,
    RestartService,
    ApplyPolicy,
    ThrottleRequests,
    ActivateFallback,
    RebalanceLoad,
    UpdateConfiguration,
    Quarantine,
}

impl RemediationAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            RemediationAction::ScaleUp { .. } => ActionKind::ScaleUp,
            RemediationAction::ScaleDown { .. } => ActionKind::ScaleDown,
            RemediationAction::RestartService { .. } => ActionKind::RestartService,
            RemediationAction::ApplyPolicy { .. } => ActionKind::ApplyPolicy,
            RemediationAction::ThrottleRequests { .. } => ActionKind::ThrottleRequests,
            RemediationAction::ActivateFallback { .. } => ActionKind::ActivateFallback,
            RemediationAction::RebalanceLoad { .. } => ActionKind::RebalanceLoad,
            RemediationAction::UpdateConfiguration { .. } => ActionKind::UpdateConfiguration,
            RemediationAction::Quarantine { .. } => ActionKind::Quarantine,
        }
    }

    /// The peer this action acts against, if any.
    pub fn target_peer(&self) -> Option<NodeId> {
        match self {
            RemediationAction::Quarantine { peer } => Some(*peer),
            RemediationAction::ThrottleRequests { target, .. }
            | RemediationAction::RestartService { target } => NodeId::from_hex(target),
            _ => None,
        }
    }
}

/// An action instantiated with its catalog estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action: RemediationAction,
    pub estimated_cost: f64,
    pub estimated_benefit: f64,
    pub estimated_latency_ms: u64,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStrategy {
    Reverse,
    Snapshot,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationPolicy {
    pub id: [u8; 32],
    pub target_violation_id: [u8; 32],
    pub cause_class: String,
    pub actions: Vec<PlannedAction>,
    pub approval_required: bool,
    pub rollback_strategy: RollbackStrategy,
}

/// A policy with its computed utility, in ranked order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPolicy {
    pub policy: RemediationPolicy,
    pub utility: f64,
}

/// Historical success estimates, served by the knowledge recorder.
pub trait SuccessHints {
    /// Estimated success probability in [0,1]; 0.5 when unknown.
    fn success_estimate(&self, cause_class: &str, action: ActionKind) -> f64;
}

/// Neutral hints for planners with no knowledge attached.
pub struct NoHints;

impl SuccessHints for NoHints {
    fn success_estimate(&self, _cause_class: &str, _action: ActionKind) -> f64 {
        0.5
    }
}

struct CatalogEntry {
    kind: ActionKind,
    cost: f64,
    benefit: f64,
    latency_ms: u64,
    idempotent: bool,
    /// Substring patterns matched against the violation kind.
    applies_to: &'static [&'static str],
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        kind: ActionKind::ThrottleRequests,
        cost: 0.2,
        benefit: 0.7,
        latency_ms: 500,
        idempotent: true,
        applies_to: &["burst", "latency", "frequency", "retry"],
    },
    CatalogEntry {
        kind: ActionKind::RestartService,
        cost: 0.5,
        benefit: 0.6,
        latency_ms: 5_000,
        idempotent: false,
        applies_to: &["crash", "unresponsive", "frequency"],
    },
    CatalogEntry {
        kind: ActionKind::ScaleUp,
        cost: 0.6,
        benefit: 0.8,
        latency_ms: 8_000,
        idempotent: false,
        applies_to: &["load", "queue", "spatial", "pressure"],
    },
    CatalogEntry {
        kind: ActionKind::ScaleDown,
        cost: 0.3,
        benefit: 0.3,
        latency_ms: 8_000,
        idempotent: false,
        applies_to: &["overprovision", "idle"],
    },
    CatalogEntry {
        kind: ActionKind::RebalanceLoad,
        cost: 0.4,
        benefit: 0.6,
        latency_ms: 3_000,
        idempotent: true,
        applies_to: &["spatial", "load", "imbalance"],
    },
    CatalogEntry {
        kind: ActionKind::ApplyPolicy,
        cost: 0.3,
        benefit: 0.5,
        latency_ms: 1_000,
        idempotent: true,
        applies_to: &["causal", "policy", "charter"],
    },
    CatalogEntry {
        kind: ActionKind::ActivateFallback,
        cost: 0.7,
        benefit: 0.8,
        latency_ms: 500,
        idempotent: true,
        applies_to: &["pqc", "crypto", "algorithm"],
    },
    CatalogEntry {
        kind: ActionKind::UpdateConfiguration,
        cost: 0.2,
        benefit: 0.4,
        latency_ms: 200,
        idempotent: true,
        applies_to: &["config", "drift", "causal"],
    },
    CatalogEntry {
        kind: ActionKind::Quarantine,
        cost: 0.8,
        benefit: 0.9,
        latency_ms: 100,
        idempotent: true,
        applies_to: &["replay", "signature", "equivocation", "byzantine", "peer-down", "malicious"],
    },
];

/// The cause class of a violation: its kind minus any lag suffix, used as
/// the knowledge key.
pub fn cause_class(kind: &str) -> &str {
    match kind.find(":lag") {
        Some(idx) => &kind[..idx],
        None => kind,
    }
}

pub struct Planner {
    top_k: usize,
    top_n: usize,
}

impl Default for Planner {
    fn default() -> Self {
        Self {
            top_k: PLAN_TOP_K_VIOLATIONS,
            top_n: PLAN_TOP_N_POLICIES,
        }
    }
}

impl Planner {
    pub fn new(top_k: usize, top_n: usize) -> Self {
        Self { top_k, top_n }
    }

    /// Generate ranked candidate policies for the top violations.
    pub fn plan(
        &self,
        violations: &[Violation],
        hints: &dyn SuccessHints,
        reputations: &BTreeMap<NodeId, f32>,
    ) -> Vec<RankedPolicy> {
        let mut candidates = Vec::new();

        for violation in violations.iter().take(self.top_k) {
            let class = cause_class(&violation.kind).to_string();
            let mut applicable = Vec::new();

            for entry in CATALOG {
                if !entry.applies_to.iter().any(|p| violation.kind.contains(p)) {
                    continue;
                }
                let Some(action) = instantiate(entry.kind, violation) else {
                    continue;
                };
                applicable.push((entry, action));
            }

            for (entry, action) in &applicable {
                let planned = PlannedAction {
                    action: action.clone(),
                    estimated_cost: entry.cost,
                    estimated_benefit: entry.benefit,
                    estimated_latency_ms: entry.latency_ms,
                    idempotent: entry.idempotent,
                };
                candidates.push(self.build_policy(
                    violation,
                    &class,
                    vec![planned],
                    hints,
                    reputations,
                ));
            }

            // Escalation combo for critical violations: throttle first, then
            // restart, rolled back in reverse if either fails.
            if violation.severity == Severity::Critical {
                let throttle = applicable
                    .iter()
                    .find(|(e, _)| e.kind == ActionKind::ThrottleRequests);
                let restart = applicable
                    .iter()
                    .find(|(e, _)| e.kind == ActionKind::RestartService);
                if let (Some((te, ta)), Some((re, ra))) = (throttle, restart) {
                    let actions = vec![
                        PlannedAction {
                            action: ta.clone(),
                            estimated_cost: te.cost,
                            estimated_benefit: te.benefit,
                            estimated_latency_ms: te.latency_ms,
                            idempotent: te.idempotent,
                        },
                        PlannedAction {
                            action: ra.clone(),
                            estimated_cost: re.cost,
                            estimated_benefit: re.benefit,
                            estimated_latency_ms: re.latency_ms,
                            idempotent: re.idempotent,
                        },
                    ];
                    candidates.push(self.build_policy(violation, &class, actions, hints, reputations));
                }
            }
        }

        candidates.sort_by(|a, b| b.utility.total_cmp(&a.utility));
        candidates.truncate(self.top_n);
        candidates
    }

    fn build_policy(
        &self,
        violation: &Violation,
        class: &str,
        actions: Vec<PlannedAction>,
        hints: &dyn SuccessHints,
        reputations: &BTreeMap<NodeId, f32>,
    ) -> RankedPolicy {
        let mut utility = 0.0;
        let mut approval_required = false;

        for planned in &actions {
            let history = hints.success_estimate(class, planned.action.kind());
            let peer_risk = planned
                .action
                .target_peer()
                .map(|peer| reputations.get(&peer).copied().unwrap_or(0.5) as f64)
                .unwrap_or(0.0);

            utility += W_BENEFIT * planned.estimated_benefit
                - W_COST * planned.estimated_cost
                - W_RISK * peer_risk
                + W_HISTORY * history;

            match &planned.action {
                RemediationAction::Quarantine { .. } => approval_required = true,
                action => {
                    if let Some(peer) = action.target_peer() {
                        let rep = reputations.get(&peer).copied().unwrap_or(0.5);
                        if rep >= TRUSTED_PEER_BAR {
                            approval_required = true;
                        }
                    }
                }
            }
        }

        let kind_bytes: Vec<u8> = actions
            .iter()
            .map(|a| a.action.kind() as u8)
            .collect();
        let id = blake2b256(&[&violation.id, &kind_bytes, class.as_bytes()]);

        RankedPolicy {
            policy: RemediationPolicy {
                id,
                target_violation_id: violation.id,
                cause_class: class.to_string(),
                actions,
                approval_required,
                rollback_strategy: RollbackStrategy::Reverse,
            },
            utility,
        }
    }
}

/// Fill in action parameters from the violation's evidence.
fn instantiate(kind: ActionKind, violation: &Violation) -> Option<RemediationAction> {
    let peer = violation.involved_peers.first();
    let component = violation
        .kind
        .split(':')
        .nth(1)
        .unwrap_or("unknown")
        .to_string();

    let action = match kind {
        ActionKind::ThrottleRequests => RemediationAction::ThrottleRequests {
            target: peer.map(|p| p.to_hex()).unwrap_or_else(|| component.clone()),
            rate_pct: 50,
        },
        ActionKind::RestartService => RemediationAction::RestartService {
            target: component,
        },
        ActionKind::ScaleUp => RemediationAction::ScaleUp {
            component,
            delta: 1,
        },
        ActionKind::ScaleDown => RemediationAction::ScaleDown {
            component,
            delta: 1,
        },
        ActionKind::RebalanceLoad => {
            let mut peers = violation.involved_peers.iter();
            let from = peers.next()?;
            RemediationAction::RebalanceLoad {
                from: from.to_hex(),
                to: peers.next().map(|p| p.to_hex()).unwrap_or_default(),
                share: 0.5,
            }
        }
        ActionKind::ApplyPolicy => RemediationAction::ApplyPolicy {
            policy_id: cause_class(&violation.kind).to_string(),
        },
        ActionKind::ActivateFallback => RemediationAction::ActivateFallback {
            reason: violation.kind.clone(),
            ttl_secs: 3_600,
        },
        ActionKind::UpdateConfiguration => RemediationAction::UpdateConfiguration {
            key: component,
            value: "reduced".to_string(),
            scope: "local".to_string(),
        },
        ActionKind::Quarantine => RemediationAction::Quarantine { peer: *peer? },
    };
    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = id;
        NodeId(bytes)
    }

    fn violation(kind: &str, severity: Severity, peers: Vec<NodeId>) -> Violation {
        Violation::new(kind.to_string(), severity, 0.85, vec![], 1_000, 2_000, peers)
    }

    #[test]
    fn test_latency_burst_plans_throttle_first() {
        let planner = Planner::default();
        let v = violation("temporal-burst:high-latency", Severity::Warn, vec![node(3)]);
        let ranked = planner.plan(&[v], &NoHints, &BTreeMap::new());

        assert!(!ranked.is_empty());
        let top = &ranked[0].policy;
        assert_eq!(top.actions.len(), 1);
        match &top.actions[0].action {
            RemediationAction::ThrottleRequests { target, rate_pct } => {
                assert_eq!(*rate_pct, 50);
                assert_eq!(*target, node(3).to_hex());
            }
            other => panic!("expected throttle, got {other:?}"),
        }
        assert!(!top.approval_required);
    }

    #[test]
    fn test_quarantine_requires_approval() {
        let planner = Planner::default();
        let v = violation("replay-storm:peer", Severity::Critical, vec![node(4)]);
        let ranked = planner.plan(&[v], &NoHints, &BTreeMap::new());

        let quarantine = ranked
            .iter()
            .find(|r| {
                r.policy
                    .actions
                    .iter()
                    .any(|a| matches!(a.action, RemediationAction::Quarantine { .. }))
            })
            .expect("quarantine candidate");
        assert!(quarantine.policy.approval_required);
    }

    #[test]
    fn test_high_reputation_target_raises_risk_and_approval() {
        let planner = Planner::default();
        let v = violation("temporal-burst:high-latency", Severity::Warn, vec![node(3)]);

        let neutral = planner.plan(&[v.clone()], &NoHints, &BTreeMap::new());
        let mut reps = BTreeMap::new();
        reps.insert(node(3), 0.95f32);
        let trusted = planner.plan(&[v], &NoHints, &reps);

        // Same top action, but lower utility and approval gating against a
        // trusted peer.
        assert!(trusted[0].utility < neutral[0].utility);
        assert!(trusted[0].policy.approval_required);
    }

    #[test]
    fn test_history_success_raises_utility() {
        struct GoodThrottleHistory;
        impl SuccessHints for GoodThrottleHistory {
            fn success_estimate(&self, _c: &str, action: ActionKind) -> f64 {
                if action == ActionKind::ThrottleRequests {
                    0.95
                } else {
                    0.1
                }
            }
        }

        let planner = Planner::default();
        let v = violation("frequency-anomaly:retry", Severity::Warn, vec![node(2)]);
        let ranked = planner.plan(&[v], &GoodThrottleHistory, &BTreeMap::new());

        assert_eq!(
            ranked[0].policy.actions[0].action.kind(),
            ActionKind::ThrottleRequests
        );
    }

    #[test]
    fn test_top_n_bound() {
        let planner = Planner::default();
        let violations: Vec<Violation> = (0..6)
            .map(|i| {
                violation(
                    "frequency-anomaly:retry",
                    Severity::Warn,
                    vec![node(i as u8 + 1)],
                )
            })
            .collect();
        let ranked = planner.plan(&violations, &NoHints, &BTreeMap::new());
        assert!(ranked.len() <= PLAN_TOP_N_POLICIES);
    }

    #[test]
    fn test_critical_frequency_gets_escalation_combo() {
        let planner = Planner::new(5, 10);
        let v = violation("frequency-anomaly:retry", Severity::Critical, vec![node(2)]);
        let ranked = planner.plan(&[v], &NoHints, &BTreeMap::new());

        let combo = ranked
            .iter()
            .find(|r| r.policy.actions.len() == 2)
            .expect("escalation combo");
        assert_eq!(combo.policy.actions[0].action.kind(), ActionKind::ThrottleRequests);
        assert_eq!(combo.policy.actions[1].action.kind(), ActionKind::RestartService);
        assert_eq!(combo.policy.rollback_strategy, RollbackStrategy::Reverse);
    }

    #[test]
    fn test_inapplicable_kinds_produce_nothing() {
        let planner = Planner::default();
        let v = violation("completely-unknown", Severity::Info, vec![]);
        assert!(planner.plan(&[v], &NoHints, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_cause_class_strips_lag_suffix() {
        assert_eq!(
            cause_class("causal-correlation:a~b:lag3s"),
            "causal-correlation:a~b"
        );
        assert_eq!(cause_class("temporal-burst:x"), "temporal-burst:x");
    }
}
