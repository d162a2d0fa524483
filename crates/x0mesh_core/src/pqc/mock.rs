//! Deterministic stub backend for tests.
//!
//! Not cryptography. KEM secrets and signatures are BLAKE2b constructions so
//! round trips and negative tests behave, nothing more. Guarded by the
//! `mock-pqc` feature and the `allow_mock_pqc` runtime flag.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;

use super::{
    KemAlgorithm, KemPublicKey, KemSecretKey, PqcBackend, SharedSecret, SigAlgorithm, SigPublicKey,
    SigSecretKey, SignatureScheme,
};
use crate::error::PqcError;

type Blake2b256 = Blake2b<U32>;

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[derive(Default)]
pub(super) struct MockBackend;

impl PqcBackend for MockBackend {
    fn kem_keypair(&self, _alg: KemAlgorithm) -> Result<(KemPublicKey, KemSecretKey), PqcError> {
        let mut sk = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut sk);
        let pk = digest(&[b"mock-kem-pk", &sk]);
        Ok((KemPublicKey(pk.to_vec()), KemSecretKey(sk.to_vec())))
    }

    fn encapsulate(
        &self,
        _alg: KemAlgorithm,
        peer: &KemPublicKey,
    ) -> Result<(Vec<u8>, SharedSecret), PqcError> {
        let mut eph = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut eph);
        let ss = digest(&[b"mock-kem-ss", &peer.0, &eph]);
        Ok((eph.to_vec(), SharedSecret(ss)))
    }

    fn decapsulate(
        &self,
        _alg: KemAlgorithm,
        secret: &KemSecretKey,
        ciphertext: &[u8],
    ) -> Result<SharedSecret, PqcError> {
        if ciphertext.len() != 32 {
            return Err(PqcError::InvalidCiphertext);
        }
        let pk = digest(&[b"mock-kem-pk", &secret.0]);
        Ok(SharedSecret(digest(&[b"mock-kem-ss", &pk, ciphertext])))
    }

    fn sig_keypair(&self, _alg: SigAlgorithm) -> Result<(SigPublicKey, SigSecretKey), PqcError> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let pk = digest(&[b"mock-sig-pk", &seed]);
        // Secret carries the public half so signing can bind to it.
        let mut sk = seed.to_vec();
        sk.extend_from_slice(&pk);
        Ok((SigPublicKey(pk.to_vec()), SigSecretKey(sk)))
    }

    fn sign(
        &self,
        _alg: SigAlgorithm,
        secret: &SigSecretKey,
        msg: &[u8],
    ) -> Result<Vec<u8>, PqcError> {
        if secret.0.len() != 64 {
            return Err(PqcError::InvalidKey);
        }
        // Signature binds only the public half, so verification needs no
        // secret state. Forgeable by design; tests only.
        let (_seed, pk) = secret.0.split_at(32);
        Ok(digest(&[b"mock-sig", pk, msg]).to_vec())
    }

    fn verify(
        &self,
        _alg: SigAlgorithm,
        public: &SigPublicKey,
        msg: &[u8],
        sig: &[u8],
    ) -> Result<(), PqcError> {
        let expect = digest(&[b"mock-sig", &public.0, msg]);
        if sig == expect {
            Ok(())
        } else {
            Err(PqcError::SignatureInvalid)
        }
    }

    fn scheme(&self, _alg: SigAlgorithm) -> SignatureScheme {
        SignatureScheme::Mock
    }
}
