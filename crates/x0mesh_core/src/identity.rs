//! Node identity and epoch rotation.
//!
//! One long-lived ML-DSA signing keypair anchors the `NodeId`; an ed25519
//! keypair rides alongside for the classical fallback path. The per-epoch
//! ML-KEM keypair rotates on schedule (or on nonce exhaustion), bumping the
//! epoch. The previous KEM keypair survives a grace period to validate
//! in-flight traffic, then is zeroized.

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::error::{MeshError, PqcError};
use crate::pqc::{
    KemPublicKey, KemSecretKey, PqcEngine, SigPublicKey, SigSecretKey, SignatureScheme,
};
use crate::types::NodeId;
use crate::wire::RevokeBody;

/// Per-epoch key material.
struct EpochKeys {
    epoch: u64,
    kem_public: KemPublicKey,
    kem_secret: KemSecretKey,
}

/// Outcome of a rotation, to be gossiped.
pub struct RotationAnnouncement {
    pub revoke: RevokeBody,
    pub new_epoch: u64,
}

type EpochCallback = Box<dyn Fn(u64) + Send + Sync>;

/// The node's identity and key schedule.
pub struct Identity {
    node_id: NodeId,
    sig_public: SigPublicKey,
    sig_secret: SigSecretKey,
    classical_signing: ed25519_dalek::SigningKey,
    current: EpochKeys,
    previous: Option<(EpochKeys, u64)>,
    rotation_interval_ms: u64,
    grace_period_ms: u64,
    last_rotation_ms: u64,
    path: Option<PathBuf>,
    callbacks: Vec<EpochCallback>,
}

/// Serialized identity state (key material hex-encoded).
#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    epoch: u64,
    sig_public: String,
    sig_secret: String,
    classical_secret: String,
    kem_public: String,
    kem_secret: String,
    last_rotation_ms: u64,
}

impl Identity {
    /// Generate a fresh identity at epoch 1.
    pub fn generate(
        engine: &PqcEngine,
        rotation_interval_ms: u64,
        grace_period_ms: u64,
        now_ms: u64,
    ) -> Result<Self, PqcError> {
        let (sig_public, sig_secret) = engine.generate_sig_keypair()?;
        let (kem_public, kem_secret) = engine.generate_kem_keypair()?;
        let classical_signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let node_id = NodeId::from_signing_public(&sig_public.0);

        Ok(Self {
            node_id,
            sig_public,
            sig_secret,
            classical_signing,
            current: EpochKeys {
                epoch: 1,
                kem_public,
                kem_secret,
            },
            previous: None,
            rotation_interval_ms,
            grace_period_ms,
            last_rotation_ms: now_ms,
            path: None,
            callbacks: Vec::new(),
        })
    }

    /// Load the persisted identity, or generate and persist a new one.
    pub fn load_or_generate(
        path: &Path,
        engine: &PqcEngine,
        rotation_interval_ms: u64,
        grace_period_ms: u64,
        now_ms: u64,
    ) -> Result<Self, MeshError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            match serde_json::from_str::<IdentityRecord>(&content) {
                Ok(record) => {
                    let mut identity =
                        Self::from_record(record, rotation_interval_ms, grace_period_ms)?;
                    identity.path = Some(path.to_path_buf());
                    info!(node_id = %identity.node_id, epoch = identity.epoch(), "loaded identity");
                    return Ok(identity);
                }
                Err(e) => {
                    // Unreadable key material means the signing key is lost.
                    warn!(error = %e, "identity file corrupt, forcing fresh identity");
                }
            }
        }

        let mut identity = Self::generate(engine, rotation_interval_ms, grace_period_ms, now_ms)?;
        identity.path = Some(path.to_path_buf());
        identity.persist()?;
        info!(node_id = %identity.node_id, "generated new identity");
        Ok(identity)
    }

    fn from_record(
        record: IdentityRecord,
        rotation_interval_ms: u64,
        grace_period_ms: u64,
    ) -> Result<Self, MeshError> {
        let decode = |s: &str| hex::decode(s).map_err(|_| MeshError::KeyLoss);
        let sig_public = SigPublicKey(decode(&record.sig_public)?);
        let sig_secret = SigSecretKey(decode(&record.sig_secret)?);
        let classical_bytes: [u8; 32] = decode(&record.classical_secret)?
            .try_into()
            .map_err(|_| MeshError::KeyLoss)?;
        let node_id = NodeId::from_signing_public(&sig_public.0);

        Ok(Self {
            node_id,
            sig_public,
            sig_secret,
            classical_signing: ed25519_dalek::SigningKey::from_bytes(&classical_bytes),
            current: EpochKeys {
                epoch: record.epoch,
                kem_public: KemPublicKey(decode(&record.kem_public)?),
                kem_secret: KemSecretKey(decode(&record.kem_secret)?),
            },
            previous: None,
            rotation_interval_ms,
            grace_period_ms,
            last_rotation_ms: record.last_rotation_ms,
            path: None,
            callbacks: Vec::new(),
        })
    }

    fn persist(&self) -> Result<(), MeshError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let record = IdentityRecord {
            epoch: self.current.epoch,
            sig_public: hex::encode(&self.sig_public.0),
            sig_secret: hex::encode(&self.sig_secret.0),
            classical_secret: hex::encode(self.classical_signing.to_bytes()),
            kem_public: hex::encode(&self.current.kem_public.0),
            kem_secret: hex::encode(&self.current.kem_secret.0),
            last_rotation_ms: self.last_rotation_ms,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&record).map_err(|e| {
            MeshError::Codec(e.to_string())
        })?)?;
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn epoch(&self) -> u64 {
        self.current.epoch
    }

    pub fn sig_public(&self) -> &SigPublicKey {
        &self.sig_public
    }

    pub fn classical_public(&self) -> [u8; 32] {
        self.classical_signing.verifying_key().to_bytes()
    }

    pub fn kem_public(&self) -> &KemPublicKey {
        &self.current.kem_public
    }

    pub fn kem_secret(&self) -> &KemSecretKey {
        &self.current.kem_secret
    }

    /// Previous-epoch KEM secret while within the grace period.
    pub fn previous_kem_secret(&self, now_ms: u64) -> Option<&KemSecretKey> {
        match &self.previous {
            Some((keys, retired_at))
                if now_ms.saturating_sub(*retired_at) < self.grace_period_ms =>
            {
                Some(&keys.kem_secret)
            }
            _ => None,
        }
    }

    /// Sign a message with the scheme currently in force (ML-DSA, or
    /// ed25519 during classical fallback).
    pub fn sign(
        &self,
        engine: &PqcEngine,
        msg: &[u8],
        now_ms: u64,
    ) -> Result<(SignatureScheme, Vec<u8>), PqcError> {
        if engine.fallback_active(now_ms) {
            let secret = SigSecretKey(self.classical_signing.to_bytes().to_vec());
            let sig = engine.sign(SignatureScheme::Ed25519, &secret, msg)?;
            Ok((SignatureScheme::Ed25519, sig))
        } else {
            let scheme = engine.signature_scheme();
            let sig = engine.sign(scheme, &self.sig_secret, msg)?;
            Ok((scheme, sig))
        }
    }

    pub fn on_epoch_change(&mut self, callback: EpochCallback) {
        self.callbacks.push(callback);
    }

    /// Rotation is due by schedule or by outbound nonce usage.
    pub fn needs_rotation(&self, now_ms: u64, max_session_nonce: u64) -> bool {
        now_ms.saturating_sub(self.last_rotation_ms) >= self.rotation_interval_ms
            || max_session_nonce >= crate::session::NONCE_ROTATION_LIMIT
    }

    /// Rotate the per-epoch KEM keypair and bump the epoch. Idempotent
    /// within an epoch: a second call inside the grace window is a no-op.
    pub fn rotate(
        &mut self,
        engine: &PqcEngine,
        now_ms: u64,
    ) -> Result<Option<RotationAnnouncement>, MeshError> {
        if self.previous.is_some()
            && now_ms.saturating_sub(self.last_rotation_ms) < self.grace_period_ms
        {
            return Ok(None);
        }

        let (new_public, new_secret) = engine.generate_kem_keypair()?;
        let new_epoch = self.current.epoch + 1;
        let old = std::mem::replace(
            &mut self.current,
            EpochKeys {
                epoch: new_epoch,
                kem_public: new_public,
                kem_secret: new_secret,
            },
        );

        let revoke = RevokeBody {
            old_kem_public: old.kem_public.0.clone(),
            new_kem_public: self.current.kem_public.0.clone(),
            new_epoch,
        };

        // Retire the old keys; they stay valid through the grace period.
        if let Some((mut expired, _)) = self.previous.replace((old, now_ms)) {
            expired.kem_secret.0.zeroize();
        }
        self.last_rotation_ms = now_ms;
        self.persist()?;

        info!(epoch = new_epoch, "identity rotated");
        for callback in &self.callbacks {
            callback(new_epoch);
        }

        Ok(Some(RotationAnnouncement { revoke, new_epoch }))
    }

    /// Zeroize grace-expired key material. Call periodically.
    pub fn expire_grace(&mut self, now_ms: u64) {
        let expired = matches!(
            &self.previous,
            Some((_, retired_at)) if now_ms.saturating_sub(*retired_at) >= self.grace_period_ms
        );
        if expired {
            if let Some((mut keys, _)) = self.previous.take() {
                keys.kem_secret.0.zeroize();
            }
        }
    }

    /// Zeroize everything on shutdown.
    pub fn destroy(&mut self) {
        self.sig_secret.0.zeroize();
        self.current.kem_secret.0.zeroize();
        if let Some((mut keys, _)) = self.previous.take() {
            keys.kem_secret.0.zeroize();
        }
    }
}
