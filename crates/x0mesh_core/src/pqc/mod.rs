//! Post-quantum crypto engine.
//!
//! KEM and signature operations behind a backend selected at startup, plus
//! the hybrid combiner that folds a classical X25519 shared secret and the
//! ML-KEM shared secret into one session secret. The deterministic stub
//! backend is compiled only under the `mock-pqc` feature and additionally
//! gated by the `allow_mock_pqc` runtime flag; `production_mode` excludes it.

#[cfg(feature = "pqc")]
mod backend;
#[cfg(feature = "mock-pqc")]
mod mock;
mod pool;

pub use pool::PqcPool;

use std::sync::{Arc, Mutex};

use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::CryptoConfig;
use crate::error::PqcError;

/// Domain separation label for the hybrid key derivation.
pub const HYBRID_KDF_LABEL: &[u8] = b"x0-hybrid-v1";

/// ML-KEM parameter sets by NIST security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KemAlgorithm {
    KemL1,
    #[default]
    KemL3,
    KemL5,
}

/// ML-DSA parameter sets by NIST security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigAlgorithm {
    SigL2,
    #[default]
    SigL3,
    SigL5,
}

/// Signature algorithm tag carried in each wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    MlDsa(SigAlgorithm),
    /// Classical fallback signatures, only valid while fallback mode is live.
    Ed25519,
    /// Test stub.
    Mock,
}

impl SignatureScheme {
    pub fn wire_tag(self) -> u8 {
        match self {
            SignatureScheme::MlDsa(SigAlgorithm::SigL2) => 0x01,
            SignatureScheme::MlDsa(SigAlgorithm::SigL3) => 0x02,
            SignatureScheme::MlDsa(SigAlgorithm::SigL5) => 0x03,
            SignatureScheme::Ed25519 => 0x10,
            SignatureScheme::Mock => 0x7f,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(SignatureScheme::MlDsa(SigAlgorithm::SigL2)),
            0x02 => Some(SignatureScheme::MlDsa(SigAlgorithm::SigL3)),
            0x03 => Some(SignatureScheme::MlDsa(SigAlgorithm::SigL5)),
            0x10 => Some(SignatureScheme::Ed25519),
            0x7f => Some(SignatureScheme::Mock),
            _ => None,
        }
    }

    pub fn signature_len(self) -> usize {
        match self {
            SignatureScheme::MlDsa(SigAlgorithm::SigL2) => 2_420,
            SignatureScheme::MlDsa(SigAlgorithm::SigL3) => 3_293,
            SignatureScheme::MlDsa(SigAlgorithm::SigL5) => 4_595,
            SignatureScheme::Ed25519 => 64,
            SignatureScheme::Mock => 32,
        }
    }
}

/// KEM public key, opaque bytes of the active parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemPublicKey(pub Vec<u8>);

/// KEM secret key, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KemSecretKey(pub Vec<u8>);

/// Long-lived signing public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigPublicKey(pub Vec<u8>);

/// Long-lived signing secret key, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigSecretKey(pub Vec<u8>);

/// 32-byte shared or session secret, zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; 32]);

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Backend contract: a concrete ML-KEM/ML-DSA implementation or the stub.
pub trait PqcBackend: Send + Sync {
    fn kem_keypair(&self, alg: KemAlgorithm) -> Result<(KemPublicKey, KemSecretKey), PqcError>;
    fn encapsulate(
        &self,
        alg: KemAlgorithm,
        peer: &KemPublicKey,
    ) -> Result<(Vec<u8>, SharedSecret), PqcError>;
    fn decapsulate(
        &self,
        alg: KemAlgorithm,
        secret: &KemSecretKey,
        ciphertext: &[u8],
    ) -> Result<SharedSecret, PqcError>;
    fn sig_keypair(&self, alg: SigAlgorithm) -> Result<(SigPublicKey, SigSecretKey), PqcError>;
    fn sign(&self, alg: SigAlgorithm, secret: &SigSecretKey, msg: &[u8]) -> Result<Vec<u8>, PqcError>;
    fn verify(
        &self,
        alg: SigAlgorithm,
        public: &SigPublicKey,
        msg: &[u8],
        sig: &[u8],
    ) -> Result<(), PqcError>;
    fn scheme(&self, alg: SigAlgorithm) -> SignatureScheme;
}

#[derive(Debug, Clone, Copy)]
struct FallbackState {
    entered_at_ms: u64,
    ttl_ms: u64,
}

/// Engine facade over the selected backend plus classical primitives.
pub struct PqcEngine {
    kem_alg: KemAlgorithm,
    sig_alg: SigAlgorithm,
    backend: Arc<dyn PqcBackend>,
    production_mode: bool,
    fallback_ttl_ms: u64,
    fallback: Mutex<Option<FallbackState>>,
}

impl PqcEngine {
    /// Select and validate a backend. Fatal in production when no real
    /// backend is compiled in, and when the mock/production flags collide.
    pub fn new(cfg: &CryptoConfig) -> Result<Self, PqcError> {
        if cfg.production_mode && cfg.allow_mock_pqc {
            return Err(PqcError::MutuallyExclusiveFlags);
        }

        let backend = Self::select_backend(cfg)?;
        Ok(Self {
            kem_alg: cfg.kem_algorithm,
            sig_alg: cfg.sig_algorithm,
            backend,
            production_mode: cfg.production_mode,
            fallback_ttl_ms: cfg.fallback_ttl_secs * 1_000,
            fallback: Mutex::new(None),
        })
    }

    fn select_backend(cfg: &CryptoConfig) -> Result<Arc<dyn PqcBackend>, PqcError> {
        if cfg.allow_mock_pqc {
            #[cfg(feature = "mock-pqc")]
            {
                return Ok(Arc::new(mock::MockBackend::default()));
            }
            #[cfg(not(feature = "mock-pqc"))]
            {
                return Err(PqcError::AlgorithmUnavailable(
                    "mock backend not compiled in".into(),
                ));
            }
        }

        #[cfg(feature = "pqc")]
        {
            Ok(Arc::new(backend::MlBackend))
        }
        #[cfg(not(feature = "pqc"))]
        {
            Err(PqcError::AlgorithmUnavailable(
                "no post-quantum backend compiled in".into(),
            ))
        }
    }

    pub fn kem_algorithm(&self) -> KemAlgorithm {
        self.kem_alg
    }

    pub fn sig_algorithm(&self) -> SigAlgorithm {
        self.sig_alg
    }

    pub fn production_mode(&self) -> bool {
        self.production_mode
    }

    /// Scheme this node signs with while PQC is healthy.
    pub fn signature_scheme(&self) -> SignatureScheme {
        self.backend.scheme(self.sig_alg)
    }

    pub fn generate_kem_keypair(&self) -> Result<(KemPublicKey, KemSecretKey), PqcError> {
        self.backend.kem_keypair(self.kem_alg)
    }

    pub fn encapsulate(&self, peer: &KemPublicKey) -> Result<(Vec<u8>, SharedSecret), PqcError> {
        self.backend.encapsulate(self.kem_alg, peer)
    }

    pub fn decapsulate(
        &self,
        secret: &KemSecretKey,
        ciphertext: &[u8],
    ) -> Result<SharedSecret, PqcError> {
        self.backend.decapsulate(self.kem_alg, secret, ciphertext)
    }

    pub fn generate_sig_keypair(&self) -> Result<(SigPublicKey, SigSecretKey), PqcError> {
        self.backend.sig_keypair(self.sig_alg)
    }

    /// Sign under the given scheme. `Ed25519` expects a 32-byte dalek secret.
    pub fn sign(
        &self,
        scheme: SignatureScheme,
        secret: &SigSecretKey,
        msg: &[u8],
    ) -> Result<Vec<u8>, PqcError> {
        match scheme {
            SignatureScheme::MlDsa(alg) => self.backend.sign(alg, secret, msg),
            SignatureScheme::Mock => self.backend.sign(self.sig_alg, secret, msg),
            SignatureScheme::Ed25519 => {
                let bytes: [u8; 32] = secret
                    .0
                    .as_slice()
                    .try_into()
                    .map_err(|_| PqcError::InvalidKey)?;
                let key = ed25519_dalek::SigningKey::from_bytes(&bytes);
                Ok(key.sign(msg).to_bytes().to_vec())
            }
        }
    }

    pub fn verify(
        &self,
        scheme: SignatureScheme,
        public: &SigPublicKey,
        msg: &[u8],
        sig: &[u8],
    ) -> Result<(), PqcError> {
        match scheme {
            SignatureScheme::MlDsa(alg) => self.backend.verify(alg, public, msg, sig),
            SignatureScheme::Mock => self.backend.verify(self.sig_alg, public, msg, sig),
            SignatureScheme::Ed25519 => {
                let pk_bytes: [u8; 32] = public
                    .0
                    .as_slice()
                    .try_into()
                    .map_err(|_| PqcError::InvalidKey)?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&pk_bytes)
                    .map_err(|_| PqcError::InvalidKey)?;
                let sig_bytes: [u8; 64] = sig.try_into().map_err(|_| PqcError::SignatureInvalid)?;
                let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                key.verify(msg, &signature)
                    .map_err(|_| PqcError::SignatureInvalid)
            }
        }
    }

    /// Enter classical-only fallback after a runtime backend loss. The TTL
    /// bounds how long new classical sessions are accepted.
    pub fn enter_fallback(&self, now_ms: u64) {
        let mut fb = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        if fb.is_none() {
            *fb = Some(FallbackState {
                entered_at_ms: now_ms,
                ttl_ms: self.fallback_ttl_ms,
            });
        }
    }

    pub fn fallback_active(&self, now_ms: u64) -> bool {
        let fb = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*fb, Some(s) if now_ms < s.entered_at_ms.saturating_add(s.ttl_ms))
    }

    /// Fallback was entered and its TTL has lapsed: stop accepting new sessions.
    pub fn fallback_expired(&self, now_ms: u64) -> bool {
        let fb = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*fb, Some(s) if now_ms >= s.entered_at_ms.saturating_add(s.ttl_ms))
    }

    /// Whether a new classical-only session may be accepted right now.
    pub fn accepts_classical_session(&self, now_ms: u64) -> bool {
        if self.production_mode {
            // Strict mode: only a live fallback window permits classical.
            self.fallback_active(now_ms)
        } else {
            !self.fallback_expired(now_ms)
        }
    }
}

/// Derive the session secret from the classical and PQ shared secrets bound
/// to the handshake transcript.
pub fn hybrid_combine(
    classical: &SharedSecret,
    post_quantum: &SharedSecret,
    transcript_hash: &[u8; 32],
) -> SharedSecret {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(&classical.0);
    ikm.extend_from_slice(&post_quantum.0);
    let out = hkdf_expand(&ikm, transcript_hash);
    ikm.zeroize();
    out
}

/// Classical-only derivation used by fallback sessions.
pub fn classical_combine(classical: &SharedSecret, transcript_hash: &[u8; 32]) -> SharedSecret {
    hkdf_expand(&classical.0, transcript_hash)
}

fn hkdf_expand(ikm: &[u8], salt: &[u8; 32]) -> SharedSecret {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    // 32-byte output can never exceed the HKDF expansion bound.
    hk.expand(HYBRID_KDF_LABEL, &mut okm)
        .unwrap_or_else(|_| unreachable!("32-byte HKDF expansion"));
    SharedSecret(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutually_exclusive_flags_fatal() {
        let cfg = CryptoConfig {
            allow_mock_pqc: true,
            production_mode: true,
            ..CryptoConfig::default()
        };
        assert_eq!(
            PqcEngine::new(&cfg).err(),
            Some(PqcError::MutuallyExclusiveFlags)
        );
    }

    #[test]
    fn test_kem_round_trip() {
        let engine = PqcEngine::new(&CryptoConfig::default()).unwrap();
        let (pk, sk) = engine.generate_kem_keypair().unwrap();
        let (ct, ss_enc) = engine.encapsulate(&pk).unwrap();
        let ss_dec = engine.decapsulate(&sk, &ct).unwrap();
        assert_eq!(ss_enc, ss_dec);
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let engine = PqcEngine::new(&CryptoConfig::default()).unwrap();
        let (pk, sk) = engine.generate_sig_keypair().unwrap();
        let scheme = engine.signature_scheme();
        let sig = engine.sign(scheme, &sk, b"beacon").unwrap();
        assert!(engine.verify(scheme, &pk, b"beacon", &sig).is_ok());
        assert!(engine.verify(scheme, &pk, b"tampered", &sig).is_err());
    }

    #[cfg(feature = "mock-pqc")]
    #[test]
    fn test_mock_backend_selected_by_flag() {
        let cfg = CryptoConfig {
            allow_mock_pqc: true,
            ..CryptoConfig::default()
        };
        let engine = PqcEngine::new(&cfg).unwrap();
        assert_eq!(engine.signature_scheme(), SignatureScheme::Mock);

        let (pk, sk) = engine.generate_kem_keypair().unwrap();
        let (ct, ss_enc) = engine.encapsulate(&pk).unwrap();
        assert_eq!(engine.decapsulate(&sk, &ct).unwrap(), ss_enc);

        let (pk, sk) = engine.generate_sig_keypair().unwrap();
        let sig = engine.sign(SignatureScheme::Mock, &sk, b"m").unwrap();
        assert!(engine.verify(SignatureScheme::Mock, &pk, b"m", &sig).is_ok());
        assert!(engine.verify(SignatureScheme::Mock, &pk, b"x", &sig).is_err());
    }

    #[test]
    fn test_fallback_ttl_window() {
        let cfg = CryptoConfig {
            fallback_ttl_secs: 10,
            ..CryptoConfig::default()
        };
        let engine = PqcEngine::new(&cfg).unwrap();

        assert!(!engine.fallback_active(0));
        engine.enter_fallback(1_000);
        assert!(engine.fallback_active(5_000));
        assert!(engine.accepts_classical_session(5_000));
        assert!(!engine.fallback_active(11_000));
        assert!(engine.fallback_expired(11_000));
        assert!(!engine.accepts_classical_session(11_000));
    }

    #[test]
    fn test_hybrid_combine_binds_transcript() {
        let cl = SharedSecret([1u8; 32]);
        let pq = SharedSecret([2u8; 32]);
        let a = hybrid_combine(&cl, &pq, &[3u8; 32]);
        let b = hybrid_combine(&cl, &pq, &[4u8; 32]);
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn test_scheme_wire_tags_round_trip() {
        for scheme in [
            SignatureScheme::MlDsa(SigAlgorithm::SigL2),
            SignatureScheme::MlDsa(SigAlgorithm::SigL3),
            SignatureScheme::MlDsa(SigAlgorithm::SigL5),
            SignatureScheme::Ed25519,
            SignatureScheme::Mock,
        ] {
            assert_eq!(SignatureScheme::from_wire_tag(scheme.wire_tag()), Some(scheme));
        }
        assert_eq!(SignatureScheme::from_wire_tag(0xee), None);
    }
}
