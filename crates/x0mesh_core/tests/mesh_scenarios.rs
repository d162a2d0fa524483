//! Cross-component scenarios: cold-start join, replay attacks, partition
//! recovery and the full monitor-to-remediation path. These drive the real
//! ML-KEM/ML-DSA backend end to end with frames routed in memory.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use x0mesh_core::analyzer::PatternAnalyzer;
use x0mesh_core::beacon::BeaconScheduler;
use x0mesh_core::clock::TestClock;
use x0mesh_core::config::{ControlConfig, CryptoConfig, GossipConfig, TelemetryConfig};
use x0mesh_core::error::MeshError;
use x0mesh_core::gossip::GossipLayer;
use x0mesh_core::handshake::HandshakeDriver;
use x0mesh_core::identity::Identity;
use x0mesh_core::knowledge::{KnowledgeRecorder, MemoryKnowledgeStore, PolicyResult};
use x0mesh_core::metrics::{self, MeshMetrics};
use x0mesh_core::peers::{PeerState, PeerTable};
use x0mesh_core::pqc::PqcEngine;
use x0mesh_core::reputation::{ReputationEvent, ReputationLedger};
use x0mesh_core::telemetry::{TelemetryCollector, TelemetryEvent};
use x0mesh_core::types::{NodeId, Slot};
use x0mesh_core::wire::{decode_body, encode_body, BeaconBody, Frame, FrameKind};

const SLOT_MS: u64 = 100;
const SESSION_TTL_SLOTS: u64 = 36_000;

/// Minimal in-memory node: the network-plane components wired together
/// without a socket.
struct TestNode {
    engine: Arc<PqcEngine>,
    identity: Identity,
    peers: PeerTable,
    ledger: ReputationLedger,
    gossip: GossipLayer,
    handshakes: HandshakeDriver,
    scheduler: BeaconScheduler,
    metrics: Arc<MeshMetrics>,
    addr: SocketAddr,
}

impl TestNode {
    fn new(port: u16) -> Self {
        let engine = Arc::new(PqcEngine::new(&CryptoConfig::default()).unwrap());
        let identity = Identity::generate(&engine, 86_400_000, 600_000, 0).unwrap();
        let metrics = Arc::new(MeshMetrics::new());
        let node_id = identity.node_id();
        Self {
            peers: PeerTable::new(node_id, 3_600_000),
            ledger: ReputationLedger::default(),
            gossip: GossipLayer::new(GossipConfig::default(), metrics.clone()),
            handshakes: HandshakeDriver::new(SESSION_TTL_SLOTS, SLOT_MS, metrics.clone()),
            scheduler: BeaconScheduler::new(node_id, SLOT_MS, 50, 0.3),
            metrics,
            engine,
            identity,
            addr: format!("10.0.0.1:{port}").parse().unwrap(),
        }
    }

    fn id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Mutual prior knowledge of signing keys, as a cold-start mesh has.
    fn trust(&mut self, other: &TestNode) {
        self.peers.register_trusted(
            other.id(),
            other.addr,
            other.identity.sig_public().clone(),
            Some(other.identity.classical_public()),
        );
    }

    fn beacon(&mut self, slot: Slot, now_ms: u64) -> Frame {
        let body = BeaconBody {
            slot,
            neighbor_digest: self.peers.neighbor_digest(),
        };
        self.gossip
            .seal(
                &self.engine,
                &self.identity,
                FrameKind::Beacon,
                encode_body(&body).unwrap(),
                now_ms,
            )
            .unwrap()
    }

    /// Verify and dispatch one inbound frame, returning any frames to send
    /// back, addressed by recipient id.
    fn deliver(
        &mut self,
        frame: Frame,
        from: SocketAddr,
        slot: Slot,
        now_ms: u64,
    ) -> Result<Vec<(NodeId, Frame)>, MeshError> {
        let sender = frame.sender;
        let verified = self.gossip.verify_inbound(
            frame,
            &self.engine,
            &mut self.peers,
            &mut self.ledger,
            now_ms,
        )?;
        let frame = verified.frame;
        self.peers.record_valid_traffic(&sender, now_ms, slot);

        let mut replies = Vec::new();
        match frame.kind {
            FrameKind::Beacon => {
                let body: BeaconBody = decode_body(&frame.payload)?;
                self.peers.observe_beacon(sender, from, frame.epoch, slot);
                self.scheduler.on_beacon(sender, body.slot, now_ms);
                self.ledger.record(sender, ReputationEvent::ValidBeacon, now_ms);

                let discovered = self
                    .peers
                    .get(&sender)
                    .is_some_and(|p| p.state == PeerState::Discovered);
                if discovered && !self.handshakes.is_in_flight(&sender) {
                    let init = self
                        .handshakes
                        .initiate(sender, &self.identity, &self.engine, slot, now_ms)
                        .unwrap();
                    self.peers.begin_handshake(&sender, slot);
                    let out = self
                        .gossip
                        .seal(
                            &self.engine,
                            &self.identity,
                            FrameKind::HandshakeInit,
                            encode_body(&init).unwrap(),
                            now_ms,
                        )
                        .unwrap();
                    replies.push((sender, out));
                }
            }
            FrameKind::HandshakeInit => {
                let body = decode_body(&frame.payload)?;
                self.peers.begin_handshake(&sender, slot);
                match self.handshakes.on_init(
                    sender,
                    frame.epoch,
                    &body,
                    &self.identity,
                    &self.engine,
                    slot,
                    now_ms,
                ) {
                    Ok(resp) => {
                        let out = self
                            .gossip
                            .seal(
                                &self.engine,
                                &self.identity,
                                FrameKind::HandshakeResp,
                                encode_body(&resp).unwrap(),
                                now_ms,
                            )
                            .unwrap();
                        replies.push((sender, out));
                    }
                    Err(failure) => {
                        self.ledger.adjust(sender, failure.penalty(), now_ms);
                        self.peers.handshake_failed(&sender, slot);
                    }
                }
            }
            FrameKind::HandshakeResp => {
                let body = decode_body(&frame.payload)?;
                match self.handshakes.on_resp(
                    sender,
                    frame.epoch,
                    &body,
                    &self.identity,
                    &self.engine,
                    slot,
                    now_ms,
                ) {
                    Ok((session, finish)) => {
                        self.peers.handshake_complete(&sender, session, slot);
                        self.ledger
                            .record(sender, ReputationEvent::ValidHandshake, now_ms);
                        let out = self
                            .gossip
                            .seal(
                                &self.engine,
                                &self.identity,
                                FrameKind::HandshakeFinish,
                                encode_body(&finish).unwrap(),
                                now_ms,
                            )
                            .unwrap();
                        replies.push((sender, out));
                    }
                    Err(failure) => {
                        self.ledger.adjust(sender, failure.penalty(), now_ms);
                        self.peers.handshake_failed(&sender, slot);
                    }
                }
            }
            FrameKind::HandshakeFinish => {
                let body = decode_body(&frame.payload)?;
                match self.handshakes.on_finish(sender, &body, slot) {
                    Ok(session) => {
                        self.peers.handshake_complete_passive(&sender, session, slot);
                        self.ledger
                            .record(sender, ReputationEvent::ValidHandshake, now_ms);
                    }
                    Err(failure) => {
                        self.ledger.adjust(sender, failure.penalty(), now_ms);
                        self.peers.handshake_failed(&sender, slot);
                    }
                }
            }
            _ => {}
        }
        Ok(replies)
    }
}

/// Deliver beacons from every node to every other, then pump handshake
/// replies until the mesh goes quiet.
fn converge(nodes: &mut [TestNode], slot: Slot, now_ms: u64) {
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id()).collect();
    let addrs: Vec<SocketAddr> = nodes.iter().map(|n| n.addr).collect();

    let mut inbox: Vec<(usize, SocketAddr, Frame)> = Vec::new();
    for i in 0..nodes.len() {
        let beacon = nodes[i].beacon(slot, now_ms);
        for j in 0..nodes.len() {
            if i != j {
                inbox.push((j, addrs[i], beacon.clone()));
            }
        }
    }

    let mut rounds = 0;
    while !inbox.is_empty() && rounds < 32 {
        rounds += 1;
        let mut next = Vec::new();
        for (to, from_addr, frame) in inbox.drain(..) {
            if let Ok(replies) = nodes[to].deliver(frame, from_addr, slot, now_ms) {
                for (target, reply) in replies {
                    let target_idx = ids.iter().position(|id| *id == target).unwrap();
                    next.push((target_idx, addrs[to], reply));
                }
            }
        }
        inbox = next;
    }
}

#[test]
fn test_fresh_join_three_nodes_all_active() {
    let mut nodes = vec![TestNode::new(1), TestNode::new(2), TestNode::new(3)];
    for i in 0..3 {
        for j in 0..3 {
            if i != j {
                let (left, right) = if i < j {
                    let (a, b) = nodes.split_at_mut(j);
                    (&mut a[i], &b[0])
                } else {
                    let (a, b) = nodes.split_at_mut(i);
                    (&mut b[0], &a[j])
                };
                left.trust(right);
            }
        }
    }

    converge(&mut nodes, 10, 1_000);

    for node in &nodes {
        assert_eq!(
            node.peers.count_in_state(PeerState::Active),
            2,
            "node {} should see two active peers",
            node.id()
        );
        for id in node.peers.active_ids() {
            assert!(node.peers.get(&id).unwrap().session.is_some());
        }
    }

    // Two directions per pair, each success counted at its initiator: six
    // across the mesh.
    let total: u64 = nodes
        .iter()
        .map(|n| n.metrics.counter(metrics::PQC_HANDSHAKE_SUCCESS_TOTAL))
        .sum();
    assert_eq!(total, 6);
}

#[test]
fn test_both_directions_install_hybrid_sessions() {
    let mut nodes = vec![TestNode::new(1), TestNode::new(2)];
    let (a, b) = nodes.split_at_mut(1);
    a[0].trust(&b[0]);
    b[0].trust(&a[0]);

    converge(&mut nodes, 5, 500);

    let id_a = nodes[0].id();
    let id_b = nodes[1].id();
    let session_ab = nodes[0]
        .peers
        .get(&id_b)
        .and_then(|p| p.session.as_ref())
        .expect("session a->b");
    let session_ba = nodes[1]
        .peers
        .get(&id_a)
        .and_then(|p| p.session.as_ref())
        .expect("session b->a");
    assert!(!session_ab.classical_only);
    assert!(!session_ba.classical_only);
    assert_eq!(session_ab.rotate_at_slot, 5 + SESSION_TTL_SLOTS);
}

#[test]
fn test_replayed_beacon_penalized_without_state_mutation() {
    let mut nodes = vec![TestNode::new(1), TestNode::new(2)];
    let (a, b) = nodes.split_at_mut(1);
    a[0].trust(&b[0]);
    b[0].trust(&a[0]);

    let sender_addr = nodes[1].addr;
    let beacon = nodes[1].beacon(3, 300);
    let sender = nodes[1].id();

    nodes[0]
        .deliver(beacon.clone(), sender_addr, 3, 300)
        .unwrap();
    let score_before = nodes[0].ledger.score(&sender, 400);
    let state_before = nodes[0].peers.get(&sender).unwrap().state;

    // Attacker replays the captured frame 100 ms later.
    let err = nodes[0]
        .deliver(beacon, sender_addr, 4, 400)
        .unwrap_err();
    assert!(matches!(err, MeshError::ReplayDetected { .. }));
    assert_eq!(
        nodes[0].metrics.counter(metrics::GOSSIP_REPLAYS_DROPPED_TOTAL),
        1
    );

    let score_after = nodes[0].ledger.score(&sender, 400);
    assert!((score_before - score_after - 0.3).abs() < 1e-3);
    assert_eq!(nodes[0].peers.get(&sender).unwrap().state, state_before);
}

#[test]
fn test_forged_beacon_fails_signature() {
    let mut nodes = vec![TestNode::new(1), TestNode::new(2)];
    let (a, b) = nodes.split_at_mut(1);
    a[0].trust(&b[0]);
    b[0].trust(&a[0]);

    let sender_addr = nodes[1].addr;
    let mut beacon = nodes[1].beacon(3, 300);
    beacon.payload[0] ^= 0x01; // attacker-altered content

    let sender = nodes[1].id();
    let err = nodes[0].deliver(beacon, sender_addr, 3, 300).unwrap_err();
    assert!(matches!(err, MeshError::InvalidSignature { .. }));
    let score = nodes[0].ledger.score(&sender, 300);
    assert!((score - 0.3).abs() < 1e-3);
}

#[test]
fn test_partition_heal_without_quarantine() {
    let mut nodes = vec![TestNode::new(1), TestNode::new(2)];
    let (a, b) = nodes.split_at_mut(1);
    a[0].trust(&b[0]);
    b[0].trust(&a[0]);
    converge(&mut nodes, 10, 1_000);

    let id_b = nodes[1].id();
    assert_eq!(nodes[0].peers.get(&id_b).unwrap().state, PeerState::Active);

    // Link drops: the peer misses enough beacons to degrade and then fall
    // out entirely.
    for s in 0..3u64 {
        nodes[0].peers.record_missed_beacon(&id_b, 11 + s);
    }
    nodes[0]
        .ledger
        .record(id_b, ReputationEvent::MissedSlots, 1_500);
    assert_eq!(nodes[0].peers.get(&id_b).unwrap().state, PeerState::Degraded);
    for s in 0..10u64 {
        nodes[0].peers.record_missed_beacon(&id_b, 20 + s);
    }
    assert_eq!(nodes[0].peers.get(&id_b).unwrap().state, PeerState::Gone);

    // Link loss is not malice: the score never drops near quarantine.
    assert!(nodes[0].ledger.score(&id_b, 2_000) >= 0.4);

    // Heal: beacons cross again and the pair re-establishes a session.
    converge(&mut nodes, 120, 12_000);
    assert_eq!(nodes[0].peers.get(&id_b).unwrap().state, PeerState::Active);
    assert_eq!(nodes[0].peers.count_in_state(PeerState::Quarantined), 0);
}

#[test]
fn test_isolated_node_beacons_and_quorum_cannot_pass() {
    use x0mesh_core::config::QuorumConfig;
    use x0mesh_core::quorum::{CriticalEvent, QuorumValidator, QuorumVerdict};

    let mut node = TestNode::new(1);

    // Still beacons with zero peers: it owns every slot.
    let tick = node.scheduler.on_tick(0, &node.peers.active_ids()).unwrap();
    assert!(tick.ours);
    let beacon = node.beacon(tick.slot, 0);
    assert_eq!(beacon.kind, FrameKind::Beacon);

    // No quorum-requiring event can succeed in isolation.
    let mut quorum = QuorumValidator::new(QuorumConfig::default());
    quorum.open(
        CriticalEvent {
            id: [7u8; 32],
            kind: "peer-down:deadbeef".into(),
            origin: node.id(),
            opened_at_slot: tick.slot,
        },
        tick.slot,
    );
    let decided = quorum.evaluate(tick.slot + 10, 0);
    assert_eq!(decided.len(), 1);
    assert_eq!(decided[0].1, QuorumVerdict::Downgraded);
}

/// Monitor → Analyze → Plan → Execute → Knowledge, with the burst clearing
/// inside the verification window.
#[tokio::test(start_paused = true)]
async fn test_violation_remediated_and_learned() {
    use async_trait::async_trait;
    use tokio::sync::watch;
    use x0mesh_core::executor::{
        ActionError, ActionHandler, ActionResult, Executor,
    };
    use x0mesh_core::orchestrator::{ControlPlaneLink, Orchestrator};
    use x0mesh_core::planner::{ActionKind, RemediationAction};
    use x0mesh_core::quorum::QuorumVerdict;

    struct ApproveLink;

    #[async_trait]
    impl ControlPlaneLink for ApproveLink {
        fn reputation_snapshot(&self) -> BTreeMap<NodeId, f32> {
            BTreeMap::new()
        }
        async fn request_quorum(
            &self,
            _event: x0mesh_core::quorum::CriticalEvent,
        ) -> QuorumVerdict {
            QuorumVerdict::Accepted {
                attesters: vec![],
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

    let local = NodeId([1u8; 32]);
    let offender = NodeId([3u8; 32]);
    let clock = TestClock::new(1_000_000);
    let metrics = Arc::new(MeshMetrics::new());
    let collector = Arc::new(Mutex::new(TelemetryCollector::new(
        TelemetryConfig::default(),
        local,
    )));

    // Five high-latency reports from the same peer inside ten seconds.
    {
        let mut c = collector.lock().unwrap();
        for i in 0..5u64 {
            c.record_local(TelemetryEvent::new(
                1_000_000 - 10_000 + i * 2_000,
                offender,
                "high-latency",
                1.0,
            ));
        }
    }

    let mut executor = Executor::new(clock.clone(), metrics.clone(), 2_000);
    for kind in [
        ActionKind::ThrottleRequests,
        ActionKind::RestartService,
        ActionKind::Quarantine,
    ] {
        executor.register_handler(kind, Arc::new(OkHandler));
    }

    let knowledge = KnowledgeRecorder::new(Box::new(MemoryKnowledgeStore::new()), 0.0);
    let mut orchestrator = Orchestrator::new(
        local,
        ControlConfig {
            tick_interval_secs: 30,
            verification_window_secs: 2,
            graceful_shutdown_deadline_secs: 10,
            exploration_epsilon: 0.0,
        },
        clock.clone(),
        metrics.clone(),
        collector.clone(),
        PatternAnalyzer::new(),
        executor,
        knowledge,
        Arc::new(ApproveLink),
    );

    // The burst resolves mid-verification: advance virtual wall time past
    // the telemetry window while the executor waits.
    let clock_bg = clock.clone();
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        clock_bg.advance(400_000);
    });

    let (_tx, mut rx) = watch::channel(false);
    let report = orchestrator.run_cycle(&mut rx).await;

    assert!(report.violations >= 1);
    assert_eq!(report.executed, Some(PolicyResult::Success));
    assert_eq!(
        metrics.counter("policies_executed_total{outcome=\"success\"}"),
        1
    );
}

/// A two-step policy whose second action fails must roll back the first
/// and land as ineffective.
#[tokio::test(start_paused = true)]
async fn test_action_failure_rolls_back_and_counts() {
    use async_trait::async_trait;
    use tokio::sync::watch;
    use x0mesh_core::executor::{
        ActionError, ActionHandler, ActionResult, Executor, ViolationStatus,
    };
    use x0mesh_core::planner::{
        ActionKind, PlannedAction, RemediationAction, RemediationPolicy, RollbackStrategy,
    };

    #[derive(Default)]
    struct Log {
        rollbacks: Vec<ActionKind>,
    }

    struct StepHandler {
        log: Arc<Mutex<Log>>,
        fail: bool,
    }

    #[async_trait]
    impl ActionHandler for StepHandler {
        async fn apply(&self, _action: &RemediationAction) -> Result<ActionResult, ActionError> {
            if self.fail {
                Err(ActionError("scale-up backend unavailable".into()))
            } else {
                Ok(ActionResult {
                    detail: "committed".into(),
                    state_token: Some("undo".into()),
                })
            }
        }
        async fn rollback(
            &self,
            action: &RemediationAction,
            _result: &ActionResult,
        ) -> Result<(), ActionError> {
            self.log.lock().unwrap().rollbacks.push(action.kind());
            Ok(())
        }
    }

    let log = Arc::new(Mutex::new(Log::default()));
    let clock = TestClock::new(0);
    let metrics = Arc::new(MeshMetrics::new());
    let mut executor = Executor::new(clock, metrics.clone(), 100);
    executor.register_handler(
        ActionKind::ThrottleRequests,
        Arc::new(StepHandler {
            log: log.clone(),
            fail: false,
        }),
    );
    executor.register_handler(
        ActionKind::ScaleUp,
        Arc::new(StepHandler {
            log: log.clone(),
            fail: true,
        }),
    );

    let policy = RemediationPolicy {
        id: [9u8; 32],
        target_violation_id: [8u8; 32],
        cause_class: "spatial-cooccurrence:queue-depth".into(),
        actions: vec![
            PlannedAction {
                action: RemediationAction::ThrottleRequests {
                    target: "n3".into(),
                    rate_pct: 50,
                },
                estimated_cost: 0.2,
                estimated_benefit: 0.7,
                estimated_latency_ms: 10,
                idempotent: true,
            },
            PlannedAction {
                action: RemediationAction::ScaleUp {
                    component: "worker".into(),
                    delta: 2,
                },
                estimated_cost: 0.6,
                estimated_benefit: 0.8,
                estimated_latency_ms: 10,
                idempotent: false,
            },
        ],
        approval_required: false,
        rollback_strategy: RollbackStrategy::Reverse,
    };

    let (_tx, mut rx) = watch::channel(false);
    let outcome = executor
        .execute(&policy, || ViolationStatus::Unchanged, &mut rx)
        .await;

    assert_eq!(outcome.result, PolicyResult::Ineffective);
    assert_eq!(outcome.actions_applied, 1);
    assert_eq!(outcome.rollback_applied, 1);
    assert_eq!(
        log.lock().unwrap().rollbacks,
        vec![ActionKind::ThrottleRequests]
    );
    assert_eq!(
        metrics.counter("policies_executed_total{outcome=\"ineffective\"}"),
        1
    );
}
