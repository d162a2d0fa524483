//! Transactional policy execution (Execute phase).
//!
//! Preflight re-checks the violation, then actions apply in order through
//! registered `ActionHandler`s, each bounded by three times its estimated
//! latency. A failure stops the policy and rolls back every applied action
//! in reverse; rollback failures flag the policy for manual attention. The
//! verification window then re-samples the violation to classify the
//! outcome.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use crate::clock::ClockSource;
use crate::knowledge::PolicyResult;
use crate::metrics::{self, MeshMetrics};
use crate::planner::{ActionKind, RemediationAction, RemediationPolicy, RollbackStrategy};

/// Floor for per-action timeouts, so zero-latency estimates stay sane.
const MIN_ACTION_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub detail: String,
    /// Opaque handler state consumed by rollback.
    pub state_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("action handler error: {0}")]
pub struct ActionError(pub String);

/// External contract applying one action kind; not part of the core.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn apply(&self, action: &RemediationAction) -> Result<ActionResult, ActionError>;
    async fn rollback(&self, action: &RemediationAction, result: &ActionResult)
        -> Result<(), ActionError>;
    fn is_idempotent(&self) -> bool {
        true
    }
}

/// Re-sampled state of the target violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationStatus {
    Resolved,
    Reduced,
    Unchanged,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub policy_id: [u8; 32],
    pub target_violation_id: [u8; 32],
    pub result: PolicyResult,
    pub started_ms: u64,
    pub ended_ms: u64,
    pub actions_applied: usize,
    pub rollback_applied: usize,
    pub rollback_failures: usize,
    pub stabilization_ms: u64,
    pub observed_side_effects: Vec<String>,
    pub needs_manual_attention: bool,
}

pub struct Executor {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    clock: Arc<dyn ClockSource>,
    metrics: Arc<MeshMetrics>,
    verification_window_ms: u64,
    in_flight: HashSet<[u8; 32]>,
}

impl Executor {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        metrics: Arc<MeshMetrics>,
        verification_window_ms: u64,
    ) -> Self {
        Self {
            handlers: HashMap::new(),
            clock,
            metrics,
            verification_window_ms,
            in_flight: HashSet::new(),
        }
    }

    pub fn register_handler(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn has_handler(&self, kind: ActionKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Apply a policy transactionally. `probe` re-samples the target
    /// violation; `shutdown` aborts at the next action boundary (committed
    /// actions are rolled back).
    pub async fn execute(
        &mut self,
        policy: &RemediationPolicy,
        probe: impl Fn() -> ViolationStatus,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PolicyOutcome {
        let started_ms = self.clock.now_ms();
        let mut outcome = PolicyOutcome {
            policy_id: policy.id,
            target_violation_id: policy.target_violation_id,
            result: PolicyResult::Unknown,
            started_ms,
            ended_ms: started_ms,
            actions_applied: 0,
            rollback_applied: 0,
            rollback_failures: 0,
            stabilization_ms: 0,
            observed_side_effects: Vec::new(),
            needs_manual_attention: false,
        };

        // Preflight: one policy per violation, handlers present, violation
        // still current.
        if !self.in_flight.insert(policy.target_violation_id) {
            outcome.result = PolicyResult::Ineffective;
            outcome
                .observed_side_effects
                .push("another policy in flight for this violation".to_string());
            return self.finish(outcome);
        }
        let preflight_ok = policy
            .actions
            .iter()
            .all(|a| self.handlers.contains_key(&a.action.kind()));
        if !preflight_ok {
            outcome.result = PolicyResult::Ineffective;
            outcome
                .observed_side_effects
                .push("missing action handler".to_string());
            self.in_flight.remove(&policy.target_violation_id);
            return self.finish(outcome);
        }
        if probe() == ViolationStatus::Resolved {
            outcome.result = PolicyResult::Ineffective;
            outcome
                .observed_side_effects
                .push("violation already resolved at preflight".to_string());
            self.in_flight.remove(&policy.target_violation_id);
            return self.finish(outcome);
        }

        // Apply in order, stopping at the first failure or shutdown.
        let mut applied: Vec<(&RemediationAction, ActionResult)> = Vec::new();
        let mut failed = false;
        let mut cancelled = false;

        for planned in &policy.actions {
            if *shutdown.borrow() {
                cancelled = true;
                break;
            }
            let handler = self.handlers[&planned.action.kind()].clone();
            let budget_ms = (planned.estimated_latency_ms * 3).max(MIN_ACTION_TIMEOUT_MS);

            let call = timeout(Duration::from_millis(budget_ms), handler.apply(&planned.action));
            let result = tokio::select! {
                res = call => res,
                _ = shutdown.changed() => {
                    cancelled = true;
                    break;
                }
            };

            match result {
                Ok(Ok(action_result)) => {
                    outcome.actions_applied += 1;
                    applied.push((&planned.action, action_result));
                }
                Ok(Err(e)) => {
                    warn!(action = ?planned.action.kind(), error = %e, "action failed");
                    outcome
                        .observed_side_effects
                        .push(format!("{:?} failed: {e}", planned.action.kind()));
                    failed = true;
                    break;
                }
                Err(_) => {
                    warn!(action = ?planned.action.kind(), budget_ms, "action timed out");
                    outcome
                        .observed_side_effects
                        .push(format!("{:?} timed out", planned.action.kind()));
                    failed = true;
                    break;
                }
            }
        }

        if failed || cancelled {
            self.rollback(policy, &applied, &mut outcome).await;
            outcome.result = if cancelled {
                PolicyResult::Unknown
            } else if outcome.rollback_failures > 0 {
                outcome.needs_manual_attention = true;
                PolicyResult::Degradation
            } else {
                PolicyResult::Ineffective
            };
            self.in_flight.remove(&policy.target_violation_id);
            return self.finish(outcome);
        }

        // Verification window, then classify from the re-sampled violation.
        let window = Duration::from_millis(self.verification_window_ms);
        tokio::select! {
            _ = tokio::time::sleep(window) => {}
            _ = shutdown.changed() => {}
        }

        outcome.result = match probe() {
            ViolationStatus::Resolved => PolicyResult::Success,
            ViolationStatus::Reduced => PolicyResult::Partial,
            ViolationStatus::Unchanged => PolicyResult::Ineffective,
            ViolationStatus::Escalated => PolicyResult::Degradation,
        };
        self.in_flight.remove(&policy.target_violation_id);
        self.finish(outcome)
    }

    async fn rollback(
        &self,
        policy: &RemediationPolicy,
        applied: &[(&RemediationAction, ActionResult)],
        outcome: &mut PolicyOutcome,
    ) {
        if policy.rollback_strategy == RollbackStrategy::None {
            return;
        }
        for (action, result) in applied.iter().rev() {
            let handler = &self.handlers[&action.kind()];
            match handler.rollback(action, result).await {
                Ok(()) => outcome.rollback_applied += 1,
                Err(e) => {
                    warn!(action = ?action.kind(), error = %e, "rollback failed");
                    outcome.rollback_failures += 1;
                    outcome
                        .observed_side_effects
                        .push(format!("rollback of {:?} failed: {e}", action.kind()));
                }
            }
        }
    }

    fn finish(&self, mut outcome: PolicyOutcome) -> PolicyOutcome {
        outcome.ended_ms = self.clock.now_ms();
        outcome.stabilization_ms = outcome.ended_ms.saturating_sub(outcome.started_ms);
        self.metrics
            .inc_labeled(metrics::POLICIES_EXECUTED_TOTAL, "outcome", outcome.result.label());
        info!(
            policy = %hex::encode(&outcome.policy_id[..6]),
            result = outcome.result.label(),
            applied = outcome.actions_applied,
            rolled_back = outcome.rollback_applied,
            "policy execution finished"
        );
        outcome
    }
}
