//! ML-KEM / ML-DSA backend over the pqcrypto implementations.

use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as KemPk, SecretKey as KemSk, SharedSecret as KemSs,
};
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as SigPk, SecretKey as SigSk};

use super::{
    KemAlgorithm, KemPublicKey, KemSecretKey, PqcBackend, SharedSecret, SigAlgorithm, SigPublicKey,
    SigSecretKey, SignatureScheme,
};
use crate::error::PqcError;

pub(super) struct MlBackend;

macro_rules! kem_dispatch {
    ($alg:expr, $mod:ident, $body:tt) => {
        match $alg {
            KemAlgorithm::KemL1 => {
                use pqcrypto_kyber::kyber512 as $mod;
                $body
            }
            KemAlgorithm::KemL3 => {
                use pqcrypto_kyber::kyber768 as $mod;
                $body
            }
            KemAlgorithm::KemL5 => {
                use pqcrypto_kyber::kyber1024 as $mod;
                $body
            }
        }
    };
}

macro_rules! sig_dispatch {
    ($alg:expr, $mod:ident, $body:tt) => {
        match $alg {
            SigAlgorithm::SigL2 => {
                use pqcrypto_dilithium::dilithium2 as $mod;
                $body
            }
            SigAlgorithm::SigL3 => {
                use pqcrypto_dilithium::dilithium3 as $mod;
                $body
            }
            SigAlgorithm::SigL5 => {
                use pqcrypto_dilithium::dilithium5 as $mod;
                $body
            }
        }
    };
}

fn to_shared(bytes: &[u8]) -> Result<SharedSecret, PqcError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| PqcError::InvalidCiphertext)?;
    Ok(SharedSecret(arr))
}

impl PqcBackend for MlBackend {
    fn kem_keypair(&self, alg: KemAlgorithm) -> Result<(KemPublicKey, KemSecretKey), PqcError> {
        kem_dispatch!(alg, kem, {
            let (pk, sk) = kem::keypair();
            Ok((
                KemPublicKey(pk.as_bytes().to_vec()),
                KemSecretKey(sk.as_bytes().to_vec()),
            ))
        })
    }

    fn encapsulate(
        &self,
        alg: KemAlgorithm,
        peer: &KemPublicKey,
    ) -> Result<(Vec<u8>, SharedSecret), PqcError> {
        kem_dispatch!(alg, kem, {
            let pk = kem::PublicKey::from_bytes(&peer.0).map_err(|_| PqcError::InvalidKey)?;
            let (ss, ct) = kem::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), to_shared(ss.as_bytes())?))
        })
    }

    fn decapsulate(
        &self,
        alg: KemAlgorithm,
        secret: &KemSecretKey,
        ciphertext: &[u8],
    ) -> Result<SharedSecret, PqcError> {
        kem_dispatch!(alg, kem, {
            let sk = kem::SecretKey::from_bytes(&secret.0).map_err(|_| PqcError::InvalidKey)?;
            let ct =
                kem::Ciphertext::from_bytes(ciphertext).map_err(|_| PqcError::InvalidCiphertext)?;
            let ss = kem::decapsulate(&ct, &sk);
            to_shared(ss.as_bytes())
        })
    }

    fn sig_keypair(&self, alg: SigAlgorithm) -> Result<(SigPublicKey, SigSecretKey), PqcError> {
        sig_dispatch!(alg, dsa, {
            let (pk, sk) = dsa::keypair();
            Ok((
                SigPublicKey(pk.as_bytes().to_vec()),
                SigSecretKey(sk.as_bytes().to_vec()),
            ))
        })
    }

    fn sign(
        &self,
        alg: SigAlgorithm,
        secret: &SigSecretKey,
        msg: &[u8],
    ) -> Result<Vec<u8>, PqcError> {
        sig_dispatch!(alg, dsa, {
            let sk = dsa::SecretKey::from_bytes(&secret.0).map_err(|_| PqcError::InvalidKey)?;
            Ok(dsa::detached_sign(msg, &sk).as_bytes().to_vec())
        })
    }

    fn verify(
        &self,
        alg: SigAlgorithm,
        public: &SigPublicKey,
        msg: &[u8],
        sig: &[u8],
    ) -> Result<(), PqcError> {
        sig_dispatch!(alg, dsa, {
            let pk = dsa::PublicKey::from_bytes(&public.0).map_err(|_| PqcError::InvalidKey)?;
            let sig = dsa::DetachedSignature::from_bytes(sig)
                .map_err(|_| PqcError::SignatureInvalid)?;
            dsa::verify_detached_signature(&sig, msg, &pk).map_err(|_| PqcError::SignatureInvalid)
        })
    }

    fn scheme(&self, alg: SigAlgorithm) -> SignatureScheme {
        SignatureScheme::MlDsa(alg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ml_kem_round_trip_all_levels() {
        let backend = MlBackend;
        for alg in [KemAlgorithm::KemL1, KemAlgorithm::KemL3, KemAlgorithm::KemL5] {
            let (pk, sk) = backend.kem_keypair(alg).unwrap();
            let (ct, ss_a) = backend.encapsulate(alg, &pk).unwrap();
            let ss_b = backend.decapsulate(alg, &sk, &ct).unwrap();
            assert_eq!(ss_a, ss_b);
        }
    }

    #[test]
    fn test_ml_dsa_round_trip() {
        let backend = MlBackend;
        let (pk, sk) = backend.sig_keypair(SigAlgorithm::SigL3).unwrap();
        let sig = backend.sign(SigAlgorithm::SigL3, &sk, b"attest").unwrap();
        assert_eq!(sig.len(), SignatureScheme::MlDsa(SigAlgorithm::SigL3).signature_len());
        assert!(backend.verify(SigAlgorithm::SigL3, &pk, b"attest", &sig).is_ok());
        assert!(backend
            .verify(SigAlgorithm::SigL3, &pk, b"forged", &sig)
            .is_err());
    }

    #[test]
    fn test_decapsulate_garbage_rejected() {
        let backend = MlBackend;
        let (_, sk) = backend.kem_keypair(KemAlgorithm::KemL3).unwrap();
        assert!(backend
            .decapsulate(KemAlgorithm::KemL3, &sk, &[0u8; 5])
            .is_err());
    }
}
