//! Three-message hybrid key agreement.
//!
//! Init (A→B) carries A's ephemeral X25519 public and per-epoch ML-KEM
//! public; Resp (B→A) encapsulates to both, yielding the classical and PQ
//! shared secrets; Finish (A→B) proves key confirmation with an HMAC over
//! the transcript. The session secret is HKDF(s_cl ∥ s_pq) salted by the
//! BLAKE2b-256 transcript hash (both parties' id, epoch, publics and nonces
//! in lexicographic id order). Frames themselves are signed by the gossip
//! layer, giving mutual authentication under the long-lived keys.
//!
//! In fallback mode the PQ half is absent and the session derives from the
//! classical secret alone; such sessions are refused in strict production
//! outside a live fallback window.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::HandshakeFailure;
use crate::identity::Identity;
use crate::metrics::{self, MeshMetrics};
use crate::pqc::{classical_combine, hybrid_combine, PqcEngine, SharedSecret};
use crate::session::Session;
use crate::types::{blake2b256, NodeId, Slot};
use crate::wire::{HandshakeFinishBody, HandshakeInitBody, HandshakeRespBody};

type HmacSha256 = Hmac<Sha256>;

/// Reply deadline for each handshake message, in slots.
pub const REPLY_TIMEOUT_SLOTS: u64 = 2;

/// Transcript contribution of one party.
struct TranscriptParty<'a> {
    id: NodeId,
    epoch: u64,
    classical_public: [u8; 32],
    /// The initiator's KEM public, or the responder's KEM ciphertext.
    pq_material: &'a [u8],
    nonce: [u8; 32],
}

/// Hash both parties' contributions in lexicographic id order.
fn transcript_hash(a: &TranscriptParty<'_>, b: &TranscriptParty<'_>) -> [u8; 32] {
    let (first, second) = if a.id <= b.id { (a, b) } else { (b, a) };
    let first_epoch = first.epoch.to_be_bytes();
    let second_epoch = second.epoch.to_be_bytes();
    blake2b256(&[
        first.id.as_bytes(),
        &first_epoch,
        &first.classical_public,
        first.pq_material,
        &first.nonce,
        second.id.as_bytes(),
        &second_epoch,
        &second.classical_public,
        second.pq_material,
        &second.nonce,
    ])
}

fn transcript_mac(secret: &SharedSecret, transcript: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(&secret.0).expect("HMAC accepts 32-byte keys");
    mac.update(transcript);
    mac.finalize().into_bytes().into()
}

struct InitiatorState {
    classical_secret: StaticSecret,
    classical_public: [u8; 32],
    /// KEM public as sent; a rotation racing the handshake must not change
    /// the transcript.
    pq_public_sent: Vec<u8>,
    nonce: [u8; 32],
    our_epoch: u64,
    started_slot: Slot,
    deadline_slot: Slot,
    classical_only: bool,
}

struct ResponderState {
    session_secret: SharedSecret,
    transcript: [u8; 32],
    classical_only: bool,
    started_slot: Slot,
    deadline_slot: Slot,
}

/// Drives all in-flight handshakes for this node.
pub struct HandshakeDriver {
    session_ttl_slots: u64,
    slot_ms: u64,
    metrics: Arc<MeshMetrics>,
    initiated: HashMap<NodeId, InitiatorState>,
    responding: HashMap<NodeId, ResponderState>,
}

impl HandshakeDriver {
    pub fn new(session_ttl_slots: u64, slot_ms: u64, metrics: Arc<MeshMetrics>) -> Self {
        Self {
            session_ttl_slots,
            slot_ms,
            metrics,
            initiated: HashMap::new(),
            responding: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.initiated.len() + self.responding.len()
    }

    pub fn is_in_flight(&self, peer: &NodeId) -> bool {
        self.initiated.contains_key(peer) || self.responding.contains_key(peer)
    }

    /// Start a handshake toward `peer`. Returns the Init body to send.
    pub fn initiate(
        &mut self,
        peer: NodeId,
        identity: &Identity,
        engine: &PqcEngine,
        now_slot: Slot,
        now_ms: u64,
    ) -> Result<HandshakeInitBody, HandshakeFailure> {
        let classical_only = engine.fallback_active(now_ms);
        if classical_only && !engine.accepts_classical_session(now_ms) {
            return Err(HandshakeFailure::PqRefused);
        }

        let classical_secret = StaticSecret::random_from_rng(OsRng);
        let classical_public = X25519Public::from(&classical_secret).to_bytes();
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        let pq_public = if classical_only {
            Vec::new()
        } else {
            identity.kem_public().0.clone()
        };

        self.initiated.insert(
            peer,
            InitiatorState {
                classical_secret,
                classical_public,
                pq_public_sent: pq_public.clone(),
                nonce,
                our_epoch: identity.epoch(),
                started_slot: now_slot,
                deadline_slot: now_slot + REPLY_TIMEOUT_SLOTS,
                classical_only,
            },
        );
        debug!(peer = %peer, classical_only, "handshake initiated");

        Ok(HandshakeInitBody {
            classical_public,
            pq_public,
            handshake_nonce: nonce,
        })
    }

    /// Responder path: consume an Init, derive the session, emit the Resp.
    /// The session is held until the Finish MAC confirms the key.
    pub fn on_init(
        &mut self,
        initiator: NodeId,
        initiator_epoch: u64,
        body: &HandshakeInitBody,
        identity: &Identity,
        engine: &PqcEngine,
        now_slot: Slot,
        now_ms: u64,
    ) -> Result<HandshakeRespBody, HandshakeFailure> {
        let classical_only = body.pq_public.is_empty();
        if classical_only && !engine.accepts_classical_session(now_ms) {
            warn!(peer = %initiator, "refusing classical-only handshake");
            return Err(HandshakeFailure::PqRefused);
        }

        let eph_secret = StaticSecret::random_from_rng(OsRng);
        let eph_public = X25519Public::from(&eph_secret).to_bytes();
        let s_cl = SharedSecret(
            eph_secret
                .diffie_hellman(&X25519Public::from(body.classical_public))
                .to_bytes(),
        );

        let (pq_ciphertext, s_pq) = if classical_only {
            (Vec::new(), None)
        } else {
            let peer_public = crate::pqc::KemPublicKey(body.pq_public.clone());
            let (ct, ss) = engine
                .encapsulate(&peer_public)
                .map_err(|_| HandshakeFailure::DecapsulationFailed)?;
            (ct, Some(ss))
        };

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        let initiator_party = TranscriptParty {
            id: initiator,
            epoch: initiator_epoch,
            classical_public: body.classical_public,
            pq_material: &body.pq_public,
            nonce: body.handshake_nonce,
        };
        let responder_party = TranscriptParty {
            id: identity.node_id(),
            epoch: identity.epoch(),
            classical_public: eph_public,
            pq_material: &pq_ciphertext,
            nonce,
        };
        let transcript = transcript_hash(&initiator_party, &responder_party);

        let session_secret = match &s_pq {
            Some(pq) => hybrid_combine(&s_cl, pq, &transcript),
            None => classical_combine(&s_cl, &transcript),
        };

        self.responding.insert(
            initiator,
            ResponderState {
                session_secret,
                transcript,
                classical_only,
                started_slot: now_slot,
                deadline_slot: now_slot + REPLY_TIMEOUT_SLOTS,
            },
        );

        Ok(HandshakeRespBody {
            classical_public: identity.classical_public(),
            classical_ciphertext: eph_public,
            pq_ciphertext,
            handshake_nonce: nonce,
        })
    }

    /// Initiator path: consume the Resp, derive the session, emit the
    /// Finish MAC. Returns the installed session alongside the Finish body.
    pub fn on_resp(
        &mut self,
        responder: NodeId,
        responder_epoch: u64,
        body: &HandshakeRespBody,
        identity: &Identity,
        engine: &PqcEngine,
        now_slot: Slot,
        now_ms: u64,
    ) -> Result<(Session, HandshakeFinishBody), HandshakeFailure> {
        let state = self
            .initiated
            .remove(&responder)
            .ok_or(HandshakeFailure::NoSuchHandshake)?;

        let s_cl = SharedSecret(
            state
                .classical_secret
                .diffie_hellman(&X25519Public::from(body.classical_ciphertext))
                .to_bytes(),
        );

        let classical_only = state.classical_only || body.pq_ciphertext.is_empty();
        if classical_only && !state.classical_only && !engine.accepts_classical_session(now_ms) {
            // A stripped PQ ciphertext is a downgrade, not a negotiation.
            self.record_failure("downgrade");
            return Err(HandshakeFailure::PqRefused);
        }
        let s_pq = if classical_only {
            None
        } else {
            // The current epoch key first; the previous one covers a
            // rotation that raced this handshake.
            let decapsulated = engine
                .decapsulate(identity.kem_secret(), &body.pq_ciphertext)
                .or_else(|_| match identity.previous_kem_secret(now_ms) {
                    Some(prev) => engine.decapsulate(prev, &body.pq_ciphertext),
                    None => Err(crate::error::PqcError::InvalidCiphertext),
                });
            match decapsulated {
                Ok(ss) => Some(ss),
                Err(_) => {
                    self.record_failure("decapsulation");
                    return Err(HandshakeFailure::DecapsulationFailed);
                }
            }
        };

        let our_party = TranscriptParty {
            id: identity.node_id(),
            epoch: state.our_epoch,
            classical_public: state.classical_public,
            pq_material: &state.pq_public_sent,
            nonce: state.nonce,
        };
        let their_party = TranscriptParty {
            id: responder,
            epoch: responder_epoch,
            classical_public: body.classical_ciphertext,
            pq_material: &body.pq_ciphertext,
            nonce: body.handshake_nonce,
        };
        let transcript = transcript_hash(&our_party, &their_party);

        let session_secret = match &s_pq {
            Some(pq) => hybrid_combine(&s_cl, pq, &transcript),
            None => classical_combine(&s_cl, &transcript),
        };
        let mac = transcript_mac(&session_secret, &transcript);

        let session = Session::new(
            session_secret,
            now_slot,
            now_slot + self.session_ttl_slots,
            classical_only,
        );
        self.record_success(state.started_slot, now_slot);
        info!(peer = %responder, classical_only, "handshake complete (initiator)");

        Ok((session, HandshakeFinishBody { transcript_mac: mac }))
    }

    /// Responder path: verify the Finish MAC and install the session.
    pub fn on_finish(
        &mut self,
        initiator: NodeId,
        body: &HandshakeFinishBody,
        now_slot: Slot,
    ) -> Result<Session, HandshakeFailure> {
        let state = self
            .responding
            .remove(&initiator)
            .ok_or(HandshakeFailure::NoSuchHandshake)?;

        let mut mac = HmacSha256::new_from_slice(&state.session_secret.0)
            .expect("HMAC accepts 32-byte keys");
        mac.update(&state.transcript);
        if mac.verify_slice(&body.transcript_mac).is_err() {
            self.record_failure("mac_mismatch");
            return Err(HandshakeFailure::MacMismatch);
        }

        let session = Session::new(
            state.session_secret.clone(),
            now_slot,
            now_slot + self.session_ttl_slots,
            state.classical_only,
        );
        // Success metrics are the initiator's; the responder just installs.
        info!(peer = %initiator, "handshake complete (responder)");
        Ok(session)
    }

    /// Expire handshakes whose reply deadline passed. The caller reverts
    /// each peer to Discovered.
    pub fn expire(&mut self, now_slot: Slot) -> Vec<(NodeId, HandshakeFailure)> {
        let mut expired = Vec::new();
        self.initiated.retain(|peer, state| {
            if now_slot > state.deadline_slot {
                expired.push((*peer, HandshakeFailure::Timeout));
                false
            } else {
                true
            }
        });
        self.responding.retain(|peer, state| {
            if now_slot > state.deadline_slot {
                expired.push((*peer, HandshakeFailure::Timeout));
                false
            } else {
                true
            }
        });
        for (peer, _) in &expired {
            debug!(peer = %peer, "handshake timed out");
            self.metrics
                .inc_labeled(metrics::PQC_HANDSHAKE_FAILURE_TOTAL, "reason", "timeout");
        }
        expired
    }

    /// Abort any in-flight handshake with `peer`.
    pub fn abort(&mut self, peer: &NodeId) {
        self.initiated.remove(peer);
        self.responding.remove(peer);
    }

    fn record_success(&self, started_slot: Slot, now_slot: Slot) {
        self.metrics.inc(metrics::PQC_HANDSHAKE_SUCCESS_TOTAL);
        let latency_s = (now_slot.saturating_sub(started_slot) * self.slot_ms) as f64 / 1_000.0;
        self.metrics
            .set_gauge(metrics::PQC_HANDSHAKE_LATENCY_SECONDS, latency_s);
    }

    fn record_failure(&self, reason: &str) {
        self.metrics
            .inc_labeled(metrics::PQC_HANDSHAKE_FAILURE_TOTAL, "reason", reason);
    }
}
