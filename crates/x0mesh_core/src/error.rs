//! Protocol error taxonomy.
//!
//! Expected failures (bad signatures, replays, handshake aborts) are `Result`
//! values carrying one of these variants; panics are reserved for programming
//! errors. Each frame-level variant maps to a reputation disposition applied
//! by the gossip layer.

use thiserror::Error;

/// Reasons a handshake can abort, with the reputation penalty scaled by reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
    #[error("transcript signature invalid")]
    SignatureInvalid,
    #[error("KEM decapsulation failed")]
    DecapsulationFailed,
    #[error("transcript MAC mismatch")]
    MacMismatch,
    #[error("reply not received within deadline")]
    Timeout,
    #[error("no handshake in progress with this peer")]
    NoSuchHandshake,
    #[error("unexpected message for current handshake phase")]
    PhaseMismatch,
    #[error("post-quantum sessions refused while backend unavailable")]
    PqRefused,
}

impl HandshakeFailure {
    /// Reputation delta charged to the remote peer for this failure.
    pub fn penalty(self) -> f32 {
        match self {
            HandshakeFailure::SignatureInvalid => -0.2,
            HandshakeFailure::DecapsulationFailed => -0.1,
            HandshakeFailure::MacMismatch => -0.3,
            // Timeouts and phase confusion may be transient or our own fault.
            _ => 0.0,
        }
    }
}

/// Errors produced by the PQC engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PqcError {
    /// The selected backend is not compiled in or refused by policy.
    /// Fatal at startup in production mode; enters fallback at runtime.
    #[error("algorithm unavailable: {0}")]
    AlgorithmUnavailable(String),
    #[error("invalid ciphertext")]
    InvalidCiphertext,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("malformed key material")]
    InvalidKey,
    /// `allow_mock_pqc` and `production_mode` were both set.
    #[error("mock PQC and production mode are mutually exclusive")]
    MutuallyExclusiveFlags,
    #[error("pqc worker pool unavailable")]
    WorkerGone,
}

/// Top-level error for frame processing and control-plane operations.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid signature from {sender}")]
    InvalidSignature { sender: String },
    #[error("epoch mismatch: recorded {recorded}, message {message}")]
    EpochMismatch { recorded: u64, message: u64 },
    #[error("replay detected: nonce {nonce}")]
    ReplayDetected { nonce: u64 },
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("peer {0} is quarantined")]
    PeerQuarantined(String),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeFailure),
    #[error(transparent)]
    Pqc(#[from] PqcError),
    #[error("quorum deadline expired")]
    QuorumTimeout,
    #[error("action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },
    #[error("rollback failed for {action}: {reason}")]
    RollbackFailed { action: String, reason: String },
    #[error("control cycle overrun")]
    CycleOverrun,
    #[error("signing key lost")]
    KeyLoss,
    #[error("malformed frame: {0}")]
    Codec(String),
    #[error("session nonce space exhausted")]
    NonceExhausted,
    #[error("shutdown in progress")]
    Shutdown,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Reputation delta the gossip layer applies to the sender, if any.
    pub fn reputation_penalty(&self) -> Option<f32> {
        match self {
            MeshError::InvalidSignature { .. } => Some(-0.2),
            MeshError::ReplayDetected { .. } => Some(-0.3),
            // Per-excess penalty; the gossip layer caps the total per slot.
            MeshError::RateLimitExceeded => Some(-0.01),
            // Possibly a rotation in progress, no penalty.
            MeshError::EpochMismatch { .. } => None,
            MeshError::Handshake(f) => {
                let p = f.penalty();
                (p != 0.0).then_some(p)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalty_mapping() {
        assert_eq!(
            MeshError::InvalidSignature {
                sender: "x".into()
            }
            .reputation_penalty(),
            Some(-0.2)
        );
        assert_eq!(
            MeshError::ReplayDetected { nonce: 7 }.reputation_penalty(),
            Some(-0.3)
        );
        assert_eq!(
            MeshError::EpochMismatch {
                recorded: 1,
                message: 5
            }
            .reputation_penalty(),
            None
        );
    }

    #[test]
    fn test_handshake_penalties_scale_by_reason() {
        assert!(HandshakeFailure::MacMismatch.penalty() < HandshakeFailure::SignatureInvalid.penalty());
        assert!(
            HandshakeFailure::SignatureInvalid.penalty() < HandshakeFailure::DecapsulationFailed.penalty()
        );
        assert_eq!(HandshakeFailure::Timeout.penalty(), 0.0);
    }
}
