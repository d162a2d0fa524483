//! Signed control-message gossip.
//!
//! Every outbound frame is signed under the current identity; every inbound
//! frame runs the verify pipeline in order: signature, epoch window,
//! anti-replay, rate limit. Failures are dropped and charged to the sender's
//! reputation per the error taxonomy.

use std::sync::Arc;

use tracing::warn;

use crate::error::{MeshError, PqcError};
use crate::identity::Identity;
use crate::metrics::{self, MeshMetrics};
use crate::peers::{PeerState, PeerTable};
use crate::pqc::{PqcEngine, SigPublicKey, SignatureScheme};
use crate::reputation::{ReputationEvent, ReputationLedger};
use crate::types::NodeId;
use crate::wire::{Frame, FrameKind};

use crate::config::GossipConfig;

/// Inbound frame that passed the full verify pipeline.
#[derive(Debug)]
pub struct VerifiedFrame {
    pub frame: Frame,
}

pub struct GossipLayer {
    config: GossipConfig,
    metrics: Arc<MeshMetrics>,
    /// Monotonic outbound nonce, reset on epoch rotation.
    outbound_nonce: u64,
}

impl GossipLayer {
    pub fn new(config: GossipConfig, metrics: Arc<MeshMetrics>) -> Self {
        Self {
            config,
            metrics,
            outbound_nonce: 0,
        }
    }

    pub fn outbound_nonce(&self) -> u64 {
        self.outbound_nonce
    }

    /// The outbound nonce space restarts with each identity epoch.
    pub fn on_epoch_change(&mut self) {
        self.outbound_nonce = 0;
    }

    /// Sign and assemble an outbound frame.
    pub fn seal(
        &mut self,
        engine: &PqcEngine,
        identity: &Identity,
        kind: FrameKind,
        payload: Vec<u8>,
        now_ms: u64,
    ) -> Result<Frame, MeshError> {
        self.outbound_nonce += 1;
        let nonce = self.outbound_nonce;
        let sender = identity.node_id();
        let epoch = identity.epoch();

        let signing = Frame::signing_bytes(kind, &sender, epoch, nonce, &payload);
        let (scheme, signature) = identity.sign(engine, &signing, now_ms)?;

        Ok(Frame {
            kind,
            sender,
            epoch,
            nonce,
            payload,
            scheme,
            signature,
        })
    }

    /// Run the inbound pipeline. On success the peer's replay window and
    /// rate counters are updated; on failure the sender's reputation is
    /// charged and the frame must be dropped.
    pub fn verify_inbound(
        &self,
        frame: Frame,
        engine: &PqcEngine,
        peers: &mut PeerTable,
        ledger: &mut ReputationLedger,
        now_ms: u64,
    ) -> Result<VerifiedFrame, MeshError> {
        let sender = frame.sender;

        let Some(peer) = peers.get(&sender) else {
            return Err(MeshError::UnknownPeer(sender.to_hex()));
        };
        if peer.state == PeerState::Quarantined {
            return Err(MeshError::PeerQuarantined(sender.to_hex()));
        }

        // 1. Signature against the sender's recorded keys.
        if let Err(err) = self.check_signature(&frame, engine, peers, now_ms) {
            self.penalize(&err, sender, ledger, now_ms);
            return Err(err);
        }

        // 2. Epoch: current, or exactly one ahead with a rotation announced.
        Self::check_epoch(&frame, peers)?;

        // 3. Anti-replay window.
        let peer = peers.get_mut(&sender).expect("peer checked above");
        if let Err(err) = peer.recv_window.accept(frame.nonce) {
            self.metrics.inc(metrics::GOSSIP_REPLAYS_DROPPED_TOTAL);
            self.penalize(&err, sender, ledger, now_ms);
            return Err(err);
        }

        // 4. Per-slot rate limit; penalty per excess message, capped.
        peer.msgs_this_slot += 1;
        if peer.msgs_this_slot > self.config.max_msgs_per_peer_per_slot {
            let excess = peer.msgs_this_slot - self.config.max_msgs_per_peer_per_slot;
            let max_penalized =
                (self.config.rate_penalty_cap / 0.01).round() as u32;
            if excess <= max_penalized {
                ledger.record(sender, ReputationEvent::RateLimitExcess, now_ms);
            }
            warn!(peer = %sender, excess, "rate limit exceeded, dropping frame");
            return Err(MeshError::RateLimitExceeded);
        }

        Ok(VerifiedFrame { frame })
    }

    fn check_signature(
        &self,
        frame: &Frame,
        engine: &PqcEngine,
        peers: &PeerTable,
        now_ms: u64,
    ) -> Result<(), MeshError> {
        let peer = peers
            .get(&frame.sender)
            .ok_or_else(|| MeshError::UnknownPeer(frame.sender.to_hex()))?;

        let public = match frame.scheme {
            SignatureScheme::Ed25519 => {
                // Classical signatures are only meaningful inside a live
                // fallback window; strict production refuses them outright.
                if engine.production_mode() && !engine.fallback_active(now_ms) {
                    return Err(MeshError::Pqc(PqcError::AlgorithmUnavailable(
                        "classical signatures refused outside fallback".into(),
                    )));
                }
                let key = peer.classical_public.ok_or(MeshError::InvalidSignature {
                    sender: frame.sender.to_hex(),
                })?;
                SigPublicKey(key.to_vec())
            }
            _ => peer
                .sig_public
                .clone()
                .ok_or(MeshError::InvalidSignature {
                    sender: frame.sender.to_hex(),
                })?,
        };

        engine
            .verify(frame.scheme, &public, &frame.to_signing_bytes(), &frame.signature)
            .map_err(|_| MeshError::InvalidSignature {
                sender: frame.sender.to_hex(),
            })
    }

    fn check_epoch(frame: &Frame, peers: &mut PeerTable) -> Result<(), MeshError> {
        let peer = peers
            .get_mut(&frame.sender)
            .ok_or_else(|| MeshError::UnknownPeer(frame.sender.to_hex()))?;

        // First authenticated contact adopts the sender's epoch.
        if peer.epoch_seen == 0 {
            peer.epoch_seen = frame.epoch;
            return Ok(());
        }

        if frame.epoch == peer.epoch_seen {
            return Ok(());
        }
        if frame.epoch == peer.epoch_seen + 1 && peer.pending_epoch == Some(frame.epoch) {
            // Rotation commits: new epoch, fresh nonce space.
            peer.epoch_seen = frame.epoch;
            peer.pending_epoch = None;
            peer.recv_window = crate::session::RecvWindow::new();
            return Ok(());
        }
        Err(MeshError::EpochMismatch {
            recorded: peer.epoch_seen,
            message: frame.epoch,
        })
    }

    fn penalize(
        &self,
        err: &MeshError,
        sender: NodeId,
        ledger: &mut ReputationLedger,
        now_ms: u64,
    ) {
        match err {
            MeshError::InvalidSignature { .. } => {
                ledger.record(sender, ReputationEvent::InvalidSignature, now_ms);
            }
            MeshError::ReplayDetected { .. } => {
                ledger.record(sender, ReputationEvent::ReplayDetected, now_ms);
            }
            _ => {}
        }
    }
}
