//! MAPE-K orchestration (C14).
//!
//! One cooperative task runs a Monitor → Analyze → Plan → Execute →
//! Knowledge cycle per tick, never overlapping. Approval-gated policies go
//! through the quorum validator via the control-plane link before they may
//! execute. Overruns skip ticks; three consecutive overruns raise a
//! critical violation on the node itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::analyzer::{PatternAnalyzer, Severity, Violation};
use crate::clock::ClockSource;
use crate::config::ControlConfig;
use crate::executor::{Executor, ViolationStatus};
use crate::knowledge::{KnowledgeRecorder, PolicyResult};
use crate::metrics::{self, MeshMetrics};
use crate::planner::{ActionKind, Planner, RankedPolicy};
use crate::quorum::{CriticalEvent, QuorumVerdict};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use crate::types::NodeId;

/// Consecutive overruns that raise a critical self violation.
const OVERRUN_CRITICAL_THRESHOLD: u32 = 3;

/// Read access to network-plane state and the quorum path, supplied by the
/// embedding node.
#[async_trait]
pub trait ControlPlaneLink: Send + Sync {
    fn reputation_snapshot(&self) -> BTreeMap<NodeId, f32>;
    /// Submit a critical event for quorum validation and await the verdict
    /// (bounded by the quorum window internally).
    async fn request_quorum(&self, event: CriticalEvent) -> QuorumVerdict;
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub violations: usize,
    pub policies_planned: usize,
    pub executed: Option<PolicyResult>,
    pub skipped: Option<&'static str>,
}

pub struct Orchestrator {
    local_id: NodeId,
    config: ControlConfig,
    clock: Arc<dyn ClockSource>,
    metrics: Arc<MeshMetrics>,
    collector: Arc<Mutex<TelemetryCollector>>,
    analyzer: PatternAnalyzer,
    planner: Planner,
    executor: Executor,
    knowledge: KnowledgeRecorder,
    link: Arc<dyn ControlPlaneLink>,
    in_flight: Arc<AtomicBool>,
    consecutive_overruns: u32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: NodeId,
        config: ControlConfig,
        clock: Arc<dyn ClockSource>,
        metrics: Arc<MeshMetrics>,
        collector: Arc<Mutex<TelemetryCollector>>,
        analyzer: PatternAnalyzer,
        executor: Executor,
        knowledge: KnowledgeRecorder,
        link: Arc<dyn ControlPlaneLink>,
    ) -> Self {
        Self {
            local_id,
            config,
            clock,
            metrics,
            collector,
            analyzer,
            planner: Planner::default(),
            executor,
            knowledge,
            link,
            in_flight: Arc::new(AtomicBool::new(false)),
            consecutive_overruns: 0,
        }
    }

    /// Run until shutdown. Consumes self; final knowledge state is flushed
    /// on the way out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let tick = Duration::from_secs(self.config.tick_interval_secs);
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_s = self.config.tick_interval_secs, "control loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let started = self.clock.now_ms();
            let report = self.run_cycle(&mut shutdown).await;
            let elapsed_ms = self.clock.now_ms().saturating_sub(started);

            self.metrics.inc(metrics::MAPE_K_CYCLES_TOTAL);
            self.metrics.set_gauge(
                metrics::MAPE_K_CYCLE_DURATION_SECONDS,
                elapsed_ms as f64 / 1_000.0,
            );
            debug!(?report, elapsed_ms, "cycle finished");

            if elapsed_ms > tick.as_millis() as u64 {
                self.note_overrun();
            } else {
                self.consecutive_overruns = 0;
            }
        }

        info!("control loop stopping, flushing knowledge");
        self.knowledge.flush();
    }

    fn note_overrun(&mut self) {
        self.consecutive_overruns += 1;
        self.metrics.inc(metrics::MAPE_K_TICKS_SKIPPED_TOTAL);
        warn!(
            consecutive = self.consecutive_overruns,
            "control cycle overran its tick"
        );
        if self.consecutive_overruns >= OVERRUN_CRITICAL_THRESHOLD {
            error!("repeated cycle overruns, raising critical self violation");
            let now = self.clock.now_ms();
            let mut collector = self.collector.lock().unwrap_or_else(|e| e.into_inner());
            collector.record_local(TelemetryEvent::new(
                now,
                self.local_id,
                "cycle-overrun",
                self.consecutive_overruns as f64,
            ));
        }
    }

    /// One MAPE-K iteration. Public for tests and for embedding loops.
    pub async fn run_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleReport {
        // At most one in-flight cycle, ever.
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.metrics.inc(metrics::MAPE_K_TICKS_SKIPPED_TOTAL);
            return CycleReport {
                violations: 0,
                policies_planned: 0,
                executed: None,
                skipped: Some("cycle already in flight"),
            };
        }
        let report = self.cycle_inner(shutdown).await;
        self.in_flight.store(false, Ordering::SeqCst);
        report
    }

    async fn cycle_inner(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleReport {
        let now = self.clock.now_ms();

        // Monitor.
        let snapshot = {
            let mut collector = self.collector.lock().unwrap_or_else(|e| e.into_inner());
            collector.collect(now);
            collector.snapshot(now)
        };
        if *shutdown.borrow() {
            return CycleReport {
                violations: 0,
                policies_planned: 0,
                executed: None,
                skipped: Some("shutdown"),
            };
        }

        // Analyze.
        let mut violations = self.analyzer.analyze(&snapshot);
        if self.consecutive_overruns >= OVERRUN_CRITICAL_THRESHOLD {
            violations.insert(
                0,
                Violation::new(
                    "control-loop:cycle-overrun".to_string(),
                    Severity::Critical,
                    1.0,
                    vec![],
                    now,
                    now,
                    vec![self.local_id],
                ),
            );
        }
        if !violations.is_empty() {
            let mttd_s = violations
                .iter()
                .map(|v| now.saturating_sub(v.first_seen_ms) as f64)
                .sum::<f64>()
                / violations.len() as f64
                / 1_000.0;
            self.metrics.set_gauge(metrics::MESH_MTTD_SECONDS, mttd_s);
        }
        if *shutdown.borrow() {
            return CycleReport {
                violations: violations.len(),
                policies_planned: 0,
                executed: None,
                skipped: Some("shutdown"),
            };
        }

        // Plan.
        let reputations = self.link.reputation_snapshot();
        let ranked = self
            .planner
            .plan(&violations, &self.knowledge, &reputations);
        if ranked.is_empty() {
            return CycleReport {
                violations: violations.len(),
                policies_planned: 0,
                executed: None,
                skipped: None,
            };
        }

        // Pick the top policy; approval-gated ones go through quorum, and a
        // denied policy falls through to the next approval-free candidate.
        let mut chosen: Option<&RankedPolicy> = None;
        for candidate in &ranked {
            if !candidate.policy.approval_required {
                chosen = Some(candidate);
                break;
            }
            let violation = violations
                .iter()
                .find(|v| v.id == candidate.policy.target_violation_id);
            let event = CriticalEvent {
                id: candidate.policy.target_violation_id,
                kind: violation
                    .map(|v| v.kind.clone())
                    .unwrap_or_else(|| candidate.policy.cause_class.clone()),
                origin: self.local_id,
                opened_at_slot: 0,
            };
            match self.link.request_quorum(event).await {
                QuorumVerdict::Accepted { .. } => {
                    chosen = Some(candidate);
                    break;
                }
                QuorumVerdict::Downgraded => {
                    info!(
                        policy = %hex::encode(&candidate.policy.id[..6]),
                        "quorum not reached, skipping approval-gated policy"
                    );
                }
            }
        }
        let Some(chosen) = chosen else {
            return CycleReport {
                violations: violations.len(),
                policies_planned: ranked.len(),
                executed: None,
                skipped: Some("no approvable policy"),
            };
        };

        // Execute with a probe that re-analyzes the live window.
        let target = violations
            .iter()
            .find(|v| v.id == chosen.policy.target_violation_id)
            .cloned();
        let collector = self.collector.clone();
        let clock = self.clock.clone();
        let probe = move || match &target {
            Some(original) => probe_violation(&collector, clock.as_ref(), original),
            None => ViolationStatus::Resolved,
        };

        let policy = chosen.policy.clone();
        let planned_count = ranked.len();
        let violation_count = violations.len();
        let outcome = self.executor.execute(&policy, probe, shutdown).await;

        // Knowledge.
        let kinds: Vec<ActionKind> = policy.actions.iter().map(|a| a.action.kind()).collect();
        self.knowledge
            .record(&policy.cause_class, &kinds, outcome.result);

        CycleReport {
            violations: violation_count,
            policies_planned: planned_count,
            executed: Some(outcome.result),
            skipped: None,
        }
    }
}

/// Re-sample the target violation against a fresh snapshot using the
/// deterministic detectors.
fn probe_violation(
    collector: &Arc<Mutex<TelemetryCollector>>,
    clock: &dyn ClockSource,
    original: &Violation,
) -> ViolationStatus {
    let now = clock.now_ms();
    let snapshot = {
        let mut collector = collector.lock().unwrap_or_else(|e| e.into_inner());
        collector.snapshot(now)
    };
    let current = PatternAnalyzer::new().analyze(&snapshot);

    let same = current
        .iter()
        .find(|v| v.kind == original.kind && v.involved_peers == original.involved_peers);
    let escalated = current.iter().any(|v| {
        v.severity > original.severity
            && (v.involved_peers == original.involved_peers
                || crate::planner::cause_class(&v.kind)
                    == crate::planner::cause_class(&original.kind))
    });

    if escalated {
        ViolationStatus::Escalated
    } else {
        match same {
            None => ViolationStatus::Resolved,
            Some(v) if v.severity < original.severity => ViolationStatus::Reduced,
            Some(_) => ViolationStatus::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::TelemetryConfig;
    use crate::executor::{ActionError, ActionHandler, ActionResult};
    use crate::knowledge::MemoryKnowledgeStore;
    use crate::planner::RemediationAction;

    fn node(id: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = id;
        NodeId(bytes)
    }

    struct StubLink {
        approve: bool,
        asked: Mutex<u32>,
        trusted: Option<NodeId>,
    }

    impl StubLink {
        fn new(approve: bool) -> Arc<Self> {
            Arc::new(Self {
                approve,
                asked: Mutex::new(0),
                trusted: None,
            })
        }
    }

    #[async_trait]
    impl ControlPlaneLink for StubLink {
        fn reputation_snapshot(&self) -> BTreeMap<NodeId, f32> {
            let mut reps = BTreeMap::new();
            if let Some(peer) = self.trusted {
                reps.insert(peer, 0.95);
            }
            reps
        }
        async fn request_quorum(&self, _event: CriticalEvent) -> QuorumVerdict {
            *self.asked.lock().unwrap() += 1;
            if self.approve {
                QuorumVerdict::Accepted {
                    attesters: vec![node(2), node(3), node(4)],
                }
            } else {
                QuorumVerdict::Downgraded
            }
        }
    }

    struct OkHandler;

    #[async_trait]
    impl ActionHandler for OkHandler {
        async fn apply(&self, _action: &RemediationAction) -> Result<ActionResult, ActionError> {
            Ok(ActionResult {
                detail: "ok".into(),
                state_token: None,
            })
        }
        async fn rollback(
            &self,
            _action: &RemediationAction,
            _result: &ActionResult,
        ) -> Result<(), ActionError> {
            Ok(())
        }
    }

    fn orchestrator(link: Arc<StubLink>, clock: Arc<TestClock>) -> Orchestrator {
        let metrics = Arc::new(MeshMetrics::new());
        let collector = Arc::new(Mutex::new(TelemetryCollector::new(
            TelemetryConfig::default(),
            node(1),
        )));
        let mut executor = Executor::new(clock.clone(), metrics.clone(), 10);
        for kind in [
            ActionKind::ThrottleRequests,
            ActionKind::RestartService,
            ActionKind::Quarantine,
            ActionKind::ScaleUp,
            ActionKind::RebalanceLoad,
            ActionKind::UpdateConfiguration,
            ActionKind::ApplyPolicy,
        ] {
            executor.register_handler(kind, Arc::new(OkHandler));
        }
        let knowledge = KnowledgeRecorder::new(Box::new(MemoryKnowledgeStore::new()), 0.0);

        Orchestrator::new(
            node(1),
            ControlConfig {
                tick_interval_secs: 1,
                verification_window_secs: 1,
                graceful_shutdown_deadline_secs: 1,
                exploration_epsilon: 0.0,
            },
            clock,
            metrics,
            collector,
            PatternAnalyzer::new(),
            executor,
            knowledge,
            link,
        )
    }

    fn inject_burst(orch: &Orchestrator, source: NodeId, now: u64) {
        let mut collector = orch.collector.lock().unwrap();
        for i in 0..5u64 {
            collector.record_local(TelemetryEvent::new(
                now - 10_000 + i * 1_000,
                source,
                "high-latency",
                1.0,
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_window_plans_nothing() {
        let link = StubLink::new(true);
        let clock = TestClock::new(100_000);
        let mut orch = orchestrator(link, clock);
        let (_tx, mut rx) = watch::channel(false);

        let report = orch.run_cycle(&mut rx).await;
        assert_eq!(report.violations, 0);
        assert_eq!(report.executed, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_leads_to_executed_policy_and_knowledge() {
        let link = StubLink::new(true);
        let clock = TestClock::new(100_000);
        let mut orch = orchestrator(link, clock);
        inject_burst(&orch, node(3), 100_000);
        let (_tx, mut rx) = watch::channel(false);

        let report = orch.run_cycle(&mut rx).await;
        assert!(report.violations >= 1);
        // The burst resolves within the verification window (events age
        // out relative to snapshot time only in wall time; with paused
        // time the window persists, so the throttle reads as ineffective
        // or partial rather than a success).
        assert!(report.executed.is_some());

        let stats = orch
            .knowledge
            .stats("temporal-burst:high-latency", ActionKind::ThrottleRequests);
        assert_eq!(stats.trials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_quorum_blocks_approval_gated_policy() {
        // Every candidate acts against a trusted peer, so all are gated;
        // quorum denial must leave the cycle with nothing to execute.
        let link = Arc::new(StubLink {
            approve: false,
            asked: Mutex::new(0),
            trusted: Some(node(4)),
        });
        let clock = TestClock::new(500_000);
        let mut orch = orchestrator(link.clone(), clock.clone());

        {
            let mut collector = orch.collector.lock().unwrap();
            for i in 0..5u64 {
                collector.record_local(TelemetryEvent::new(
                    500_000 - 8_000 + i * 1_000,
                    node(4),
                    "replay-detected",
                    1.0,
                ));
            }
        }
        let (_tx, mut rx) = watch::channel(false);
        let report = orch.run_cycle(&mut rx).await;

        assert!(*link.asked.lock().unwrap() >= 1);
        assert_eq!(report.executed, None);
        assert_eq!(report.skipped, Some("no approvable policy"));
        let stats = orch
            .knowledge
            .stats("temporal-burst:replay-detected", ActionKind::Quarantine);
        assert_eq!(stats.trials(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_guard_skips_overlap() {
        let link = StubLink::new(true);
        let clock = TestClock::new(100_000);
        let mut orch = orchestrator(link, clock);
        let (_tx, mut rx) = watch::channel(false);

        orch.in_flight.store(true, Ordering::SeqCst);
        let report = orch.run_cycle(&mut rx).await;
        assert_eq!(report.skipped, Some("cycle already in flight"));
        // The guard is not cleared by the skipped cycle's exit path.
        orch.in_flight.store(false, Ordering::SeqCst);
        let report = orch.run_cycle(&mut rx).await;
        assert_eq!(report.skipped, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_overruns_raise_critical_self_violation() {
        let link = StubLink::new(true);
        let clock = TestClock::new(100_000);
        let mut orch = orchestrator(link, clock);

        for _ in 0..OVERRUN_CRITICAL_THRESHOLD {
            orch.note_overrun();
        }
        let (_tx, mut rx) = watch::channel(false);
        let report = orch.run_cycle(&mut rx).await;
        assert!(report.violations >= 1);
        assert!(
            orch.metrics.counter(metrics::MAPE_K_TICKS_SKIPPED_TOTAL)
                >= OVERRUN_CRITICAL_THRESHOLD as u64
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_cycle_early() {
        let link = StubLink::new(true);
        let clock = TestClock::new(100_000);
        let mut orch = orchestrator(link, clock);
        inject_burst(&orch, node(3), 100_000);

        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = orch.run_cycle(&mut rx).await;
        assert_eq!(report.executed, None);
        assert_eq!(report.skipped, Some("shutdown"));
    }
}
