//! Node assembly and the network-plane event loop.
//!
//! All peer, session and reputation mutations happen on this task; the
//! MAPE-K orchestrator runs on its own task and reads through the shared
//! view, submitting quorum requests and quarantine commands over channels.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use x0mesh_core::analyzer::PatternAnalyzer;
use x0mesh_core::beacon::BeaconScheduler;
use x0mesh_core::clock::{ClockSource, SystemClock};
use x0mesh_core::executor::Executor;
use x0mesh_core::gossip::GossipLayer;
use x0mesh_core::handshake::HandshakeDriver;
use x0mesh_core::identity::Identity;
use x0mesh_core::knowledge::{KnowledgeRecorder, MemoryKnowledgeStore};
use x0mesh_core::metrics::{self, MeshMetrics};
use x0mesh_core::orchestrator::{ControlPlaneLink, Orchestrator};
use x0mesh_core::peers::{PeerSnapshot, PeerState, PeerTable};
use x0mesh_core::planner::ActionKind;
use x0mesh_core::pqc::{PqcEngine, PqcPool};
use x0mesh_core::quorum::{Attestation, CriticalEvent, QuorumValidator, QuorumVerdict};
use x0mesh_core::reputation::{ReputationEvent, ReputationLedger};
use x0mesh_core::telemetry::{TelemetryCollector, TelemetryEvent};
use x0mesh_core::types::{NodeId, Slot};
use x0mesh_core::wire::{
    decode_body, encode_body, BeaconBody, Frame, FrameKind, GossipBody, HandshakeFinishBody,
    HandshakeInitBody, HandshakeRespBody, QuorumAttestBody, RevokeBody,
};

use crate::config::{DaemonConfig, DataLayout};
use crate::stubs::{
    FallbackHandler, LoggingActionHandler, NoopAnomalyDetector, QuarantineHandler,
    SystemMetricSource,
};
use crate::transport::UdpTransport;

/// Slots between maintenance passes (reputation decay, peer lifecycle,
/// view refresh).
const MAINTENANCE_EVERY_SLOTS: u64 = 10;
/// Slots between reputation persistence writes.
const PERSIST_EVERY_SLOTS: u64 = 600;
/// Corroboration lookback when answering quorum solicitations, ms.
const CORROBORATION_WINDOW_MS: u64 = 30_000;

/// Commands from the control plane into the network plane.
#[derive(Debug)]
pub enum NetCommand {
    RequestQuorum {
        event: CriticalEvent,
        reply: oneshot::Sender<QuorumVerdict>,
    },
    QuarantinePeer {
        peer: NodeId,
    },
    LiftQuarantine {
        peer: NodeId,
    },
}

/// Read-only state shared with the control plane and the status API.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SharedView {
    pub node_id: String,
    pub epoch: u64,
    pub slot: Slot,
    pub reputations_hex: BTreeMap<String, f32>,
    pub peers: Vec<PeerSnapshot>,
    pub fallback_active: bool,
    #[serde(skip)]
    pub reputations: BTreeMap<NodeId, f32>,
}

pub type SharedViewHandle = Arc<RwLock<SharedView>>;

/// Control-plane link backed by the shared view and the command channel.
pub struct ChannelLink {
    view: SharedViewHandle,
    commands: mpsc::Sender<NetCommand>,
    quorum_deadline: Duration,
}

#[async_trait]
impl ControlPlaneLink for ChannelLink {
    fn reputation_snapshot(&self) -> BTreeMap<NodeId, f32> {
        self.view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .reputations
            .clone()
    }

    async fn request_quorum(&self, event: CriticalEvent) -> QuorumVerdict {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(NetCommand::RequestQuorum { event, reply })
            .await
            .is_err()
        {
            return QuorumVerdict::Downgraded;
        }
        match tokio::time::timeout(self.quorum_deadline, rx).await {
            Ok(Ok(verdict)) => verdict,
            _ => QuorumVerdict::Downgraded,
        }
    }
}

/// Everything the network plane owns.
struct NetPlane {
    config: DaemonConfig,
    layout: DataLayout,
    clock: Arc<dyn ClockSource>,
    metrics: Arc<MeshMetrics>,
    engine: Arc<PqcEngine>,
    identity: Identity,
    peers: PeerTable,
    ledger: ReputationLedger,
    gossip: GossipLayer,
    handshakes: HandshakeDriver,
    scheduler: BeaconScheduler,
    quorum: QuorumValidator,
    collector: Arc<Mutex<TelemetryCollector>>,
    transport: UdpTransport,
    view: SharedViewHandle,
    /// Quorum requests awaiting verdicts for the control plane.
    pending_quorum_replies: HashMap<[u8; 32], oneshot::Sender<QuorumVerdict>>,
    /// Drift-reconvergence bookkeeping.
    drift_started_at_ms: Option<u64>,
    last_slot: Slot,
}

/// Run the mesh node until SIGINT/SIGTERM. This is the `x0mesh run` entry.
pub async fn run_node(config: DaemonConfig, layout: DataLayout) -> anyhow::Result<()> {
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let metrics = Arc::new(MeshMetrics::new());
    let now_ms = clock.now_ms();

    // Startup order: identity and PQC first; a missing backend in
    // production aborts before any frame is emitted.
    let engine = Arc::new(PqcEngine::new(&config.mesh.crypto).map_err(|e| {
        error!(error = %e, "PQC engine unavailable");
        anyhow::anyhow!(e)
    })?);
    // Keygen is the heaviest PQ operation; run it on the bounded worker
    // pool so the runtime threads stay responsive from the first tick.
    let pqc_pool = PqcPool::new(config.mesh.crypto.pqc_workers);
    let identity = {
        let engine = engine.clone();
        let path = layout.identity();
        let rotation_ms = config.mesh.crypto.rotation_interval_secs * 1_000;
        let grace_ms = config.mesh.crypto.grace_period_secs * 1_000;
        pqc_pool
            .run(move || Identity::load_or_generate(&path, &engine, rotation_ms, grace_ms, now_ms))
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .map_err(|e| anyhow::anyhow!("identity init: {e}"))?
    };
    let node_id = identity.node_id();
    info!(node_id = %node_id, epoch = identity.epoch(), "node identity ready");

    let ledger = load_reputation(&layout, &config);
    let mut peers = PeerTable::new(node_id, config.mesh.reputation.quarantine_ttl_secs * 1_000);
    // Key material was validated at config load; resolve() cannot fail here
    // short of a config race.
    for trusted in config.resolved_peers()? {
        peers.register_trusted(
            trusted.id,
            trusted.addr,
            trusted.sig_public,
            trusted.classical_public,
        );
    }

    let mut collector = TelemetryCollector::new(config.mesh.telemetry.clone(), node_id);
    collector.register_source(Box::new(SystemMetricSource::new()));
    let collector = Arc::new(Mutex::new(collector));

    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let view: SharedViewHandle = Arc::new(RwLock::new(SharedView::default()));

    // Control plane.
    let quorum_deadline = Duration::from_millis(
        config.mesh.quorum.quorum_window_slots * config.mesh.slots.slot_ms + 500,
    );
    let link = Arc::new(ChannelLink {
        view: view.clone(),
        commands: commands_tx.clone(),
        quorum_deadline,
    });
    let mut executor = Executor::new(
        clock.clone(),
        metrics.clone(),
        config.mesh.control.verification_window_secs * 1_000,
    );
    for kind in [
        ActionKind::ScaleUp,
        ActionKind::ScaleDown,
        ActionKind::RestartService,
        ActionKind::ApplyPolicy,
        ActionKind::ThrottleRequests,
        ActionKind::RebalanceLoad,
        ActionKind::UpdateConfiguration,
    ] {
        executor.register_handler(kind, Arc::new(LoggingActionHandler));
    }
    executor.register_handler(
        ActionKind::Quarantine,
        QuarantineHandler::new(commands_tx.clone()),
    );
    executor.register_handler(
        ActionKind::ActivateFallback,
        FallbackHandler::new(engine.clone(), clock.clone()),
    );

    let mut analyzer = PatternAnalyzer::new();
    analyzer.register_detector(Box::new(NoopAnomalyDetector));
    let knowledge = KnowledgeRecorder::new(
        Box::new(MemoryKnowledgeStore::with_path(layout.knowledge())),
        config.mesh.control.exploration_epsilon,
    );
    let orchestrator = Orchestrator::new(
        node_id,
        config.mesh.control.clone(),
        clock.clone(),
        metrics.clone(),
        collector.clone(),
        analyzer,
        executor,
        knowledge,
        link,
    );
    let mut control_handle = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    // Observability endpoint.
    crate::api::spawn_api(
        &config,
        metrics.clone(),
        view.clone(),
        shutdown_rx.clone(),
    );

    // Network plane.
    let transport = UdpTransport::bind(config.node.listen_addr).await?;
    info!(listen = %transport.local_addr()?, "mesh transport ready");
    let scheduler = BeaconScheduler::new(
        node_id,
        config.mesh.slots.slot_ms,
        config.mesh.slots.drift_threshold_ms,
        config.mesh.slots.drift_damping,
    );
    let gossip = GossipLayer::new(config.mesh.gossip.clone(), metrics.clone());
    let handshakes = HandshakeDriver::new(
        config.mesh.crypto.session_ttl_slots,
        config.mesh.slots.slot_ms,
        metrics.clone(),
    );
    let quorum = QuorumValidator::new(config.mesh.quorum.clone());

    let plane = NetPlane {
        config,
        layout,
        clock,
        metrics,
        engine,
        identity,
        peers,
        ledger,
        gossip,
        handshakes,
        scheduler,
        quorum,
        collector,
        transport,
        view,
        pending_quorum_replies: HashMap::new(),
        drift_started_at_ms: None,
        last_slot: 0,
    };

    // Shutdown on SIGINT/SIGTERM.
    let shutdown_deadline =
        Duration::from_secs(plane.config.mesh.control.graceful_shutdown_deadline_secs);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    plane.run(commands_rx, shutdown_rx).await;

    // The control plane finishes its current action boundary within the
    // graceful deadline or is aborted.
    if tokio::time::timeout(shutdown_deadline, &mut control_handle)
        .await
        .is_err()
    {
        warn!("control loop exceeded graceful shutdown deadline, aborting");
        control_handle.abort();
    }
    Ok(())
}

fn load_reputation(layout: &DataLayout, config: &DaemonConfig) -> ReputationLedger {
    let path = layout.reputation();
    if path.exists() {
        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(ledger) = serde_json::from_str::<ReputationLedger>(&content) {
                return ledger;
            }
            warn!("reputation file unreadable, starting fresh");
        }
    }
    ReputationLedger::new(config.mesh.reputation.clone())
}

impl NetPlane {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<NetCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Tick at half the slot width so slot edges are never missed.
        let mut ticker = interval(Duration::from_millis(
            (self.config.mesh.slots.slot_ms / 2).max(1),
        ));

        enum Wake {
            Timer,
            Frame(Frame, SocketAddr),
            Command(NetCommand),
            Shutdown,
            Idle,
        }

        loop {
            // Resolve the wake reason first so the receive future's borrow
            // ends before any state mutation.
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Timer,
                received = self.transport.recv_frame() => match received {
                    Ok((frame, from)) => Wake::Frame(frame, from),
                    Err(e) => {
                        warn!(error = %e, "transport receive failed");
                        Wake::Idle
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Idle,
                },
                _ = shutdown.changed() => Wake::Shutdown,
            };

            match wake {
                Wake::Timer => self.on_timer().await,
                Wake::Frame(frame, from) => self.on_frame(frame, from).await,
                Wake::Command(command) => self.on_command(command).await,
                Wake::Shutdown => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Wake::Idle => {}
            }
        }

        self.teardown();
    }

    fn teardown(&mut self) {
        info!("network plane stopping, zeroizing sessions");
        self.peers.destroy_all_sessions();
        self.identity.destroy();
        self.persist_reputation();
    }

    fn persist_reputation(&self) {
        let path = self.layout.reputation();
        match serde_json::to_string_pretty(&self.ledger) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!(error = %e, "failed to persist reputation");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize reputation"),
        }
    }

    async fn on_timer(&mut self) {
        let now_ms = self.clock.now_ms();
        let active = self.peers.active_ids();
        let Some(tick) = self.scheduler.on_tick(now_ms, &active) else {
            return;
        };

        // Close out the previous slot before acting on the new one.
        self.note_missed_beacons(tick.slot, now_ms);
        self.peers.reset_slot_counters();

        if tick.ours {
            self.emit_beacon(tick.slot, now_ms).await;
        }

        for (peer, failure) in self.handshakes.expire(tick.slot) {
            debug!(peer = %peer, %failure, "handshake expired");
            self.peers.handshake_failed(&peer, tick.slot);
        }

        self.settle_quorum(tick.slot, now_ms);
        self.apply_drift(now_ms);

        if tick.slot % MAINTENANCE_EVERY_SLOTS == 0 {
            self.maintenance(tick.slot, now_ms).await;
        }
        if tick.slot % PERSIST_EVERY_SLOTS == 0 && tick.slot > 0 {
            self.persist_reputation();
            self.write_state_file();
        }
        self.last_slot = tick.slot;
    }

    /// Owner of the previous slot should have beaconed; note the silence.
    fn note_missed_beacons(&mut self, slot: Slot, now_ms: u64) {
        if slot == 0 || self.last_slot == 0 {
            return;
        }
        let prev = slot - 1;
        let active = self.peers.active_ids();
        if active.is_empty() {
            return;
        }
        let owner = self.scheduler.owner(prev, &active);
        if owner == self.peers.local_id() {
            return;
        }
        let missed = self
            .peers
            .get(&owner)
            .is_some_and(|p| p.last_seen_slot < prev);
        if missed {
            self.peers.record_missed_beacon(&owner, slot);
            let count = self.peers.get(&owner).map(|p| p.missed_beacons).unwrap_or(0);
            // One reputation incident when the degradation threshold trips,
            // not one per silent slot.
            if count == x0mesh_core::peers::DEGRADE_MISSED_BEACONS {
                self.ledger.record(owner, ReputationEvent::MissedSlots, now_ms);
            }
        }
    }

    async fn emit_beacon(&mut self, slot: Slot, now_ms: u64) {
        let body = BeaconBody {
            slot,
            neighbor_digest: self.peers.neighbor_digest(),
        };
        let Ok(payload) = encode_body(&body) else {
            return;
        };
        match self
            .gossip
            .seal(&self.engine, &self.identity, FrameKind::Beacon, payload, now_ms)
        {
            Ok(frame) => self.broadcast(&frame).await,
            Err(e) => warn!(error = %e, "failed to seal beacon"),
        }
    }

    /// Send a frame to every peer that has progressed past Unknown and is
    /// not quarantined or gone.
    async fn broadcast(&self, frame: &Frame) {
        let targets: Vec<SocketAddr> = self
            .peers
            .snapshot(&self.ledger, self.clock.now_ms())
            .into_iter()
            .filter(|p| {
                !matches!(
                    p.state,
                    PeerState::Quarantined | PeerState::Gone
                )
            })
            .map(|p| p.addr)
            .collect();
        for addr in targets {
            self.transport.send_frame(frame, addr).await;
        }
    }

    async fn send_to(&self, frame: &Frame, peer: &NodeId) {
        if let Some(p) = self.peers.get(peer) {
            self.transport.send_frame(frame, p.addr).await;
        }
    }

    fn settle_quorum(&mut self, slot: Slot, _now_ms: u64) {
        let active = self.peers.count_in_state(PeerState::Active);
        for (event, verdict) in self.quorum.evaluate(slot, active) {
            if let Some(reply) = self.pending_quorum_replies.remove(&event.id) {
                let _ = reply.send(verdict);
            } else {
                // Remote-originated event: the origin applies side effects
                // after its own quorum; we only log the outcome.
                debug!(kind = %event.kind, ?verdict, "remote quorum event settled");
            }
        }
    }

    fn apply_drift(&mut self, now_ms: u64) {
        match self.scheduler.apply_drift_correction() {
            Some(_) => {
                if self.drift_started_at_ms.is_none() {
                    self.drift_started_at_ms = Some(now_ms);
                }
            }
            None => {
                if let Some(started) = self.drift_started_at_ms.take() {
                    let reconvergence_s = (now_ms.saturating_sub(started)) as f64 / 1_000.0;
                    self.metrics
                        .set_gauge(metrics::MESH_RECONVERGENCE_SECONDS, reconvergence_s);
                }
            }
        }
    }

    async fn maintenance(&mut self, slot: Slot, now_ms: u64) {
        let quarantined_before = self.peers.count_in_state(PeerState::Quarantined);
        self.peers.tick_maintenance(&self.ledger, now_ms, slot);
        let quarantined_after = self.peers.count_in_state(PeerState::Quarantined);
        if quarantined_after > quarantined_before {
            self.metrics.add(
                metrics::REPUTATION_QUARANTINES_TOTAL,
                (quarantined_after - quarantined_before) as u64,
            );
        }

        // Session rotation: renegotiate before nonces or TTL run out, and
        // re-key sessions torn down by a peer's epoch rotation.
        let rotate_peers: Vec<NodeId> = self
            .peers
            .active_ids()
            .into_iter()
            .filter(|id| {
                if self.handshakes.is_in_flight(id) {
                    return false;
                }
                self.peers
                    .get(id)
                    .map(|p| match p.session.as_ref() {
                        Some(session) => session.needs_rotation(slot),
                        None => true,
                    })
                    .unwrap_or(false)
            })
            .collect();
        for peer in rotate_peers {
            debug!(peer = %peer, "session due for rotation, renegotiating");
            self.start_handshake(peer, slot, now_ms).await;
        }

        // Identity rotation by schedule or nonce usage.
        let max_nonce = self.gossip.outbound_nonce();
        if self.identity.needs_rotation(now_ms, max_nonce) {
            self.rotate_identity(now_ms).await;
        }
        self.identity.expire_grace(now_ms);

        // Fallback accounting.
        let fallback = self.engine.fallback_active(now_ms);
        self.metrics
            .set_gauge(metrics::PQC_FALLBACK_ENABLED, if fallback { 1.0 } else { 0.0 });

        self.metrics.set_gauge(
            metrics::MESH_ACTIVE_PEERS,
            self.peers.count_in_state(PeerState::Active) as f64,
        );
        self.metrics.set_gauge(
            metrics::MESH_QUARANTINED_PEERS,
            self.peers.count_in_state(PeerState::Quarantined) as f64,
        );

        self.refresh_view(slot, now_ms);
    }

    async fn rotate_identity(&mut self, now_ms: u64) {
        // Pre-announce so receivers accept epoch+1, then revoke the old key.
        let announce = GossipBody::RotationAnnounce {
            next_epoch: self.identity.epoch() + 1,
        };
        if let Ok(payload) = encode_body(&announce) {
            if let Ok(frame) =
                self.gossip
                    .seal(&self.engine, &self.identity, FrameKind::Gossip, payload, now_ms)
            {
                self.broadcast(&frame).await;
            }
        }

        match self.identity.rotate(&self.engine, now_ms) {
            Ok(Some(announcement)) => {
                self.gossip.on_epoch_change();
                if let Ok(payload) = encode_body(&announcement.revoke) {
                    match self.gossip.seal(
                        &self.engine,
                        &self.identity,
                        FrameKind::Revoke,
                        payload,
                        now_ms,
                    ) {
                        Ok(frame) => self.broadcast(&frame).await,
                        Err(e) => warn!(error = %e, "failed to seal revoke"),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "identity rotation failed"),
        }
    }

    fn refresh_view(&self, slot: Slot, now_ms: u64) {
        let reputations = self.ledger.snapshot(now_ms);
        let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
        view.node_id = self.peers.local_id().to_hex();
        view.epoch = self.identity.epoch();
        view.slot = slot;
        view.reputations_hex = reputations
            .iter()
            .map(|(id, score)| (id.to_hex(), *score))
            .collect();
        view.reputations = reputations;
        view.peers = self.peers.snapshot(&self.ledger, now_ms);
        view.fallback_active = self.engine.fallback_active(now_ms);
    }

    fn write_state_file(&self) {
        let view = self.view.read().unwrap_or_else(|e| e.into_inner());
        if let Ok(json) = serde_json::to_string_pretty(&*view) {
            let _ = fs::write(self.layout.state(), json);
        }
    }

    async fn start_handshake(&mut self, peer: NodeId, slot: Slot, now_ms: u64) {
        match self
            .handshakes
            .initiate(peer, &self.identity, &self.engine, slot, now_ms)
        {
            Ok(body) => {
                self.peers.begin_handshake(&peer, slot);
                if let Ok(payload) = encode_body(&body) {
                    match self.gossip.seal(
                        &self.engine,
                        &self.identity,
                        FrameKind::HandshakeInit,
                        payload,
                        now_ms,
                    ) {
                        Ok(frame) => self.send_to(&frame, &peer).await,
                        Err(e) => warn!(error = %e, "failed to seal handshake init"),
                    }
                }
            }
            Err(e) => warn!(peer = %peer, error = %e, "cannot initiate handshake"),
        }
    }

    async fn on_frame(&mut self, frame: Frame, from: SocketAddr) {
        let now_ms = self.clock.now_ms();
        let slot = self.scheduler.current_slot(now_ms);
        let sender = frame.sender;
        let kind = frame.kind;

        let verified = match self.gossip.verify_inbound(
            frame,
            &self.engine,
            &mut self.peers,
            &mut self.ledger,
            now_ms,
        ) {
            Ok(v) => v,
            Err(e) => {
                debug!(peer = %sender, ?kind, error = %e, "frame rejected");
                return;
            }
        };
        let frame = verified.frame;
        self.peers.record_valid_traffic(&sender, now_ms, slot);

        match frame.kind {
            FrameKind::Beacon => self.on_beacon(frame, from, slot, now_ms).await,
            FrameKind::HandshakeInit => self.on_handshake_init(frame, slot, now_ms).await,
            FrameKind::HandshakeResp => self.on_handshake_resp(frame, slot, now_ms).await,
            FrameKind::HandshakeFinish => self.on_handshake_finish(frame, slot, now_ms),
            FrameKind::Gossip => self.on_gossip(frame, slot),
            FrameKind::QuorumAttest => self.on_quorum_attest(frame, slot, now_ms).await,
            FrameKind::Revoke => self.on_revoke(frame),
            FrameKind::DataApp => {
                // Opaque tunnel; nothing to do at the control layer.
                debug!(peer = %sender, len = frame.payload.len(), "app data frame");
            }
        }
    }

    async fn on_beacon(&mut self, frame: Frame, from: SocketAddr, slot: Slot, now_ms: u64) {
        let body: BeaconBody = match decode_body(&frame.payload) {
            Ok(b) => b,
            Err(e) => {
                debug!(peer = %frame.sender, error = %e, "malformed beacon body");
                return;
            }
        };

        self.peers
            .observe_beacon(frame.sender, from, frame.epoch, slot);
        self.scheduler.on_beacon(frame.sender, body.slot, now_ms);
        self.ledger
            .record(frame.sender, ReputationEvent::ValidBeacon, now_ms);

        // Claim conflict: the sender beaconed a slot our membership view
        // assigns to us.
        let active = self.peers.active_ids();
        if self.scheduler.owner(body.slot, &active) == self.peers.local_id() {
            self.scheduler.on_claim_conflict(frame.sender);
        }

        // Divergent neighborhood digests surface as telemetry for the
        // analyzer (partition healing, membership churn).
        if body.neighbor_digest != self.peers.neighbor_digest() && !active.is_empty() {
            let mut collector = self.collector.lock().unwrap_or_else(|e| e.into_inner());
            collector.record_local(TelemetryEvent::new(
                now_ms,
                frame.sender,
                "neighbor-divergence",
                1.0,
            ));
        }

        // Each side initiates its own outbound session on discovery.
        let should_initiate = self
            .peers
            .get(&frame.sender)
            .is_some_and(|p| p.state == PeerState::Discovered)
            && !self.handshakes.is_in_flight(&frame.sender);
        if should_initiate {
            self.start_handshake(frame.sender, slot, now_ms).await;
        }
    }

    async fn on_handshake_init(&mut self, frame: Frame, slot: Slot, now_ms: u64) {
        let body: HandshakeInitBody = match decode_body(&frame.payload) {
            Ok(b) => b,
            Err(_) => return,
        };
        self.peers.begin_handshake(&frame.sender, slot);

        match self.handshakes.on_init(
            frame.sender,
            frame.epoch,
            &body,
            &self.identity,
            &self.engine,
            slot,
            now_ms,
        ) {
            Ok(resp) => {
                if let Ok(payload) = encode_body(&resp) {
                    match self.gossip.seal(
                        &self.engine,
                        &self.identity,
                        FrameKind::HandshakeResp,
                        payload,
                        now_ms,
                    ) {
                        Ok(out) => self.send_to(&out, &frame.sender).await,
                        Err(e) => warn!(error = %e, "failed to seal handshake resp"),
                    }
                }
            }
            Err(failure) => {
                self.ledger.adjust(frame.sender, failure.penalty(), now_ms);
                self.peers.handshake_failed(&frame.sender, slot);
            }
        }
    }

    async fn on_handshake_resp(&mut self, frame: Frame, slot: Slot, now_ms: u64) {
        let body: HandshakeRespBody = match decode_body(&frame.payload) {
            Ok(b) => b,
            Err(_) => return,
        };
        match self.handshakes.on_resp(
            frame.sender,
            frame.epoch,
            &body,
            &self.identity,
            &self.engine,
            slot,
            now_ms,
        ) {
            Ok((session, finish)) => {
                // Remember the responder's classical key for fallback
                // verification.
                if let Some(peer) = self.peers.get_mut(&frame.sender) {
                    peer.classical_public.get_or_insert(body.classical_public);
                }
                self.peers.handshake_complete(&frame.sender, session, slot);
                self.ledger
                    .record(frame.sender, ReputationEvent::ValidHandshake, now_ms);
                if let Ok(payload) = encode_body(&finish) {
                    match self.gossip.seal(
                        &self.engine,
                        &self.identity,
                        FrameKind::HandshakeFinish,
                        payload,
                        now_ms,
                    ) {
                        Ok(out) => self.send_to(&out, &frame.sender).await,
                        Err(e) => warn!(error = %e, "failed to seal handshake finish"),
                    }
                }
            }
            Err(failure) => {
                self.ledger.adjust(frame.sender, failure.penalty(), now_ms);
                self.peers.handshake_failed(&frame.sender, slot);
            }
        }
    }

    fn on_handshake_finish(&mut self, frame: Frame, slot: Slot, now_ms: u64) {
        let body: HandshakeFinishBody = match decode_body(&frame.payload) {
            Ok(b) => b,
            Err(_) => return,
        };
        match self.handshakes.on_finish(frame.sender, &body, slot) {
            Ok(session) => {
                self.peers
                    .handshake_complete_passive(&frame.sender, session, slot);
                self.ledger
                    .record(frame.sender, ReputationEvent::ValidHandshake, now_ms);
            }
            Err(failure) => {
                self.ledger.adjust(frame.sender, failure.penalty(), now_ms);
                self.peers.handshake_failed(&frame.sender, slot);
            }
        }
    }

    fn on_gossip(&mut self, frame: Frame, slot: Slot) {
        let body: GossipBody = match decode_body(&frame.payload) {
            Ok(b) => b,
            Err(_) => return,
        };
        match body {
            GossipBody::Telemetry { kind, magnitude, at_ms } => {
                let event = TelemetryEvent::new(at_ms, frame.sender, kind, magnitude);
                let mut collector = self.collector.lock().unwrap_or_else(|e| e.into_inner());
                collector.ingest_peer(event, slot);
            }
            GossipBody::RotationAnnounce { next_epoch } => {
                if let Some(peer) = self.peers.get_mut(&frame.sender) {
                    if next_epoch == peer.epoch_seen + 1 {
                        peer.pending_epoch = Some(next_epoch);
                    }
                }
            }
        }
    }

    /// A peer revoked its per-epoch KEM key. Record the pending epoch and
    /// the replacement public key; the epoch commits when the first frame
    /// under it verifies.
    fn on_revoke(&mut self, frame: Frame) {
        let body: RevokeBody = match decode_body(&frame.payload) {
            Ok(b) => b,
            Err(_) => return,
        };
        let Some(peer) = self.peers.get_mut(&frame.sender) else {
            return;
        };
        if body.new_epoch != peer.epoch_seen + 1 {
            debug!(peer = %frame.sender, new_epoch = body.new_epoch, "ignoring out-of-order revoke");
            return;
        }
        if let Some(known) = &peer.kem_public {
            if known.0 != body.old_kem_public {
                warn!(peer = %frame.sender, "revoke does not match recorded KEM key");
                return;
            }
        }
        peer.pending_epoch = Some(body.new_epoch);
        peer.kem_public = Some(x0mesh_core::pqc::KemPublicKey(body.new_kem_public));
        // The old session dies with the old epoch.
        if let Some(mut session) = peer.session.take() {
            session.destroy();
        }
        info!(peer = %frame.sender, epoch = body.new_epoch, "peer key rotation recorded");
    }

    async fn on_quorum_attest(&mut self, frame: Frame, slot: Slot, now_ms: u64) {
        let body: QuorumAttestBody = match decode_body(&frame.payload) {
            Ok(b) => b,
            Err(_) => return,
        };

        if body.solicit {
            // Attest only to events we can corroborate from our own window.
            if self.corroborates(&body, now_ms) {
                let attest = QuorumAttestBody {
                    event_id: body.event_id,
                    kind: body.kind.clone(),
                    observed_slot: slot,
                    solicit: false,
                };
                if let Ok(payload) = encode_body(&attest) {
                    match self.gossip.seal(
                        &self.engine,
                        &self.identity,
                        FrameKind::QuorumAttest,
                        payload,
                        now_ms,
                    ) {
                        Ok(out) => self.broadcast(&out).await,
                        Err(e) => warn!(error = %e, "failed to seal attestation"),
                    }
                }
            }
        } else {
            let reputation = self.ledger.score(&frame.sender, now_ms);
            let quarantined = self
                .peers
                .get(&frame.sender)
                .is_some_and(|p| p.state == PeerState::Quarantined);
            self.quorum.on_attestation(
                Attestation {
                    event_id: body.event_id,
                    attester: frame.sender,
                    slot: body.observed_slot,
                },
                reputation,
                quarantined,
            );
        }
    }

    /// Independent corroboration: matching telemetry in our own recent
    /// window, or a peer-state observation that matches the claim.
    fn corroborates(&self, body: &QuorumAttestBody, now_ms: u64) -> bool {
        if let Some(peer_hex) = body.kind.strip_prefix("peer-down:") {
            if let Some(peer_id) = NodeId::from_hex(peer_hex) {
                return self.peers.get(&peer_id).is_some_and(|p| {
                    matches!(p.state, PeerState::Degraded | PeerState::Gone)
                });
            }
        }
        let class = x0mesh_core::planner::cause_class(&body.kind);
        let event_kind = class.split(':').nth(1).unwrap_or(class);
        let horizon = now_ms.saturating_sub(CORROBORATION_WINDOW_MS);
        let collector = self.collector.lock().unwrap_or_else(|e| e.into_inner());
        collector.has_recent(event_kind, horizon)
    }

    async fn on_command(&mut self, command: NetCommand) {
        let now_ms = self.clock.now_ms();
        let slot = self.scheduler.current_slot(now_ms);
        match command {
            NetCommand::RequestQuorum { event, reply } => {
                self.pending_quorum_replies.insert(event.id, reply);
                let solicit = QuorumAttestBody {
                    event_id: event.id,
                    kind: event.kind.clone(),
                    observed_slot: slot,
                    solicit: true,
                };
                self.quorum.open(event, slot);
                if let Ok(payload) = encode_body(&solicit) {
                    match self.gossip.seal(
                        &self.engine,
                        &self.identity,
                        FrameKind::QuorumAttest,
                        payload,
                        now_ms,
                    ) {
                        Ok(frame) => self.broadcast(&frame).await,
                        Err(e) => warn!(error = %e, "failed to seal solicitation"),
                    }
                }
            }
            NetCommand::QuarantinePeer { peer } => {
                if self.peers.quarantine(&peer, now_ms, slot) {
                    self.handshakes.abort(&peer);
                    self.metrics.inc(metrics::REPUTATION_QUARANTINES_TOTAL);
                    info!(peer = %peer, "peer quarantined by control plane");
                }
            }
            NetCommand::LiftQuarantine { peer } => {
                if self.peers.lift_quarantine(&peer, slot) {
                    info!(peer = %peer, "quarantine rolled back");
                }
            }
        }
    }
}

