//! Wire frame codec.
//!
//! Frame layout (one frame per datagram; length-prefixed on streams):
//!
//! ```text
//! header  : 1B version=1 | 1B kind | 2B reserved (zero)
//! sender  : 32B node id
//! epoch   : 8B unsigned BE
//! nonce   : 8B unsigned BE
//! payload : variable, CBOR body
//! sig     : signature bytes, length fixed by the trailing scheme tag
//! scheme  : 1B signature scheme tag
//! ```
//!
//! Everything before `sig` is the signing input.

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::pqc::SignatureScheme;
use crate::types::{NodeId, Slot};

pub const WIRE_VERSION: u8 = 1;
/// Fixed bytes before the payload.
pub const HEADER_LEN: usize = 4 + 32 + 8 + 8;
/// Upper bound on an encoded frame (largest handshake frame plus slack).
pub const MAX_FRAME_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Beacon = 0x01,
    HandshakeInit = 0x02,
    HandshakeResp = 0x03,
    HandshakeFinish = 0x04,
    Gossip = 0x05,
    QuorumAttest = 0x06,
    Revoke = 0x07,
    /// Opaque application tunnel.
    DataApp = 0x08,
}

impl FrameKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameKind::Beacon),
            0x02 => Some(FrameKind::HandshakeInit),
            0x03 => Some(FrameKind::HandshakeResp),
            0x04 => Some(FrameKind::HandshakeFinish),
            0x05 => Some(FrameKind::Gossip),
            0x06 => Some(FrameKind::QuorumAttest),
            0x07 => Some(FrameKind::Revoke),
            0x08 => Some(FrameKind::DataApp),
            _ => None,
        }
    }
}

/// A decoded control frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub sender: NodeId,
    pub epoch: u64,
    pub nonce: u64,
    pub payload: Vec<u8>,
    pub scheme: SignatureScheme,
    pub signature: Vec<u8>,
}

impl Frame {
    /// Bytes covered by the frame signature.
    pub fn signing_bytes(
        kind: FrameKind,
        sender: &NodeId,
        epoch: u64,
        nonce: u64,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(WIRE_VERSION);
        out.push(kind as u8);
        out.extend_from_slice(&[0u8, 0u8]);
        out.extend_from_slice(sender.as_bytes());
        out.extend_from_slice(&epoch.to_be_bytes());
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn to_signing_bytes(&self) -> Vec<u8> {
        Self::signing_bytes(self.kind, &self.sender, self.epoch, self.nonce, &self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.to_signing_bytes();
        out.extend_from_slice(&self.signature);
        out.push(self.scheme.wire_tag());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MeshError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(MeshError::Codec("frame exceeds maximum length".into()));
        }
        if bytes.len() < HEADER_LEN + 1 {
            return Err(MeshError::Codec("frame truncated".into()));
        }
        if bytes[0] != WIRE_VERSION {
            return Err(MeshError::Codec(format!("unsupported version {}", bytes[0])));
        }
        let kind = FrameKind::from_byte(bytes[1])
            .ok_or_else(|| MeshError::Codec(format!("unknown frame kind {:#04x}", bytes[1])))?;
        if bytes[2] != 0 || bytes[3] != 0 {
            return Err(MeshError::Codec("reserved bytes must be zero".into()));
        }

        let scheme_tag = bytes[bytes.len() - 1];
        let scheme = SignatureScheme::from_wire_tag(scheme_tag)
            .ok_or_else(|| MeshError::Codec(format!("unknown signature scheme {scheme_tag:#04x}")))?;
        let sig_len = scheme.signature_len();
        if bytes.len() < HEADER_LEN + sig_len + 1 {
            return Err(MeshError::Codec("frame shorter than its signature".into()));
        }

        let mut sender = [0u8; 32];
        sender.copy_from_slice(&bytes[4..36]);
        let epoch = u64::from_be_bytes(bytes[36..44].try_into().expect("8-byte slice"));
        let nonce = u64::from_be_bytes(bytes[44..52].try_into().expect("8-byte slice"));

        let sig_start = bytes.len() - 1 - sig_len;
        let payload = bytes[HEADER_LEN..sig_start].to_vec();
        let signature = bytes[sig_start..bytes.len() - 1].to_vec();

        Ok(Self {
            kind,
            sender: NodeId(sender),
            epoch,
            nonce,
            payload,
            scheme,
            signature,
        })
    }
}

/// Length-prefixed framing for stream transports: u32 BE length then frame.
pub fn encode_stream(frame: &Frame) -> Vec<u8> {
    let body = frame.encode();
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Try to pop one length-prefixed frame off the front of `buf`.
pub fn decode_stream(buf: &mut Vec<u8>) -> Result<Option<Frame>, MeshError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buf[..4].try_into().expect("4-byte slice")) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MeshError::Codec("stream frame exceeds maximum length".into()));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let frame = Frame::decode(&buf[4..4 + len])?;
    buf.drain(..4 + len);
    Ok(Some(frame))
}

// --- CBOR payload bodies ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconBody {
    pub slot: Slot,
    /// BLAKE2b-256 of the sender's sorted active peer ids.
    pub neighbor_digest: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeInitBody {
    /// Ephemeral X25519 public key.
    pub classical_public: [u8; 32],
    /// Initiator's current-epoch ML-KEM public key; empty in
    /// classical-only fallback.
    pub pq_public: Vec<u8>,
    pub handshake_nonce: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRespBody {
    /// Responder's static classical verification key.
    pub classical_public: [u8; 32],
    /// X25519 encapsulation: the responder's ephemeral public key.
    pub classical_ciphertext: [u8; 32],
    /// ML-KEM ciphertext; empty in classical-only fallback.
    pub pq_ciphertext: Vec<u8>,
    pub handshake_nonce: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeFinishBody {
    /// HMAC-SHA256 over the transcript under the derived session secret.
    pub transcript_mac: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumAttestBody {
    pub event_id: [u8; 32],
    pub kind: String,
    pub observed_slot: Slot,
    /// True on the originator's solicitation, false on attestations.
    pub solicit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeBody {
    pub old_kem_public: Vec<u8>,
    pub new_kem_public: Vec<u8>,
    pub new_epoch: u64,
}

/// Control gossip payloads that are not their own frame kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipBody {
    /// Peer-reported telemetry event.
    Telemetry {
        kind: String,
        magnitude: f64,
        at_ms: u64,
    },
    /// Pre-announcement of an epoch rotation so receivers accept epoch+1.
    RotationAnnounce { next_epoch: u64 },
}

pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, MeshError> {
    serde_cbor::to_vec(body).map_err(|e| MeshError::Codec(e.to_string()))
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, MeshError> {
    serde_cbor::from_slice(payload).map_err(|e| MeshError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(kind: FrameKind, payload: Vec<u8>) -> Frame {
        Frame {
            kind,
            sender: NodeId([9u8; 32]),
            epoch: 3,
            nonce: 41,
            payload,
            scheme: SignatureScheme::Mock,
            signature: vec![0xAB; SignatureScheme::Mock.signature_len()],
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let body = BeaconBody {
            slot: 1_234,
            neighbor_digest: [7u8; 32],
        };
        let frame = sample_frame(FrameKind::Beacon, encode_body(&body).unwrap());
        let decoded = Frame::decode(&frame.encode()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Beacon);
        assert_eq!(decoded.sender, frame.sender);
        assert_eq!(decoded.epoch, 3);
        assert_eq!(decoded.nonce, 41);
        assert_eq!(decoded.signature, frame.signature);
        assert_eq!(decode_body::<BeaconBody>(&decoded.payload).unwrap(), body);
    }

    #[test]
    fn test_all_kinds_round_trip() {
        for kind in [
            FrameKind::Beacon,
            FrameKind::HandshakeInit,
            FrameKind::HandshakeResp,
            FrameKind::HandshakeFinish,
            FrameKind::Gossip,
            FrameKind::QuorumAttest,
            FrameKind::Revoke,
            FrameKind::DataApp,
        ] {
            let frame = sample_frame(kind, vec![1, 2, 3]);
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded.kind, kind);
            assert_eq!(decoded.payload, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut bytes = sample_frame(FrameKind::Beacon, vec![]).encode();
        bytes[0] = 2;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = sample_frame(FrameKind::Beacon, vec![]).encode();
        bytes[1] = 0x7E;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_reserved_bytes_must_be_zero() {
        let mut bytes = sample_frame(FrameKind::Beacon, vec![]).encode();
        bytes[2] = 1;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bytes = sample_frame(FrameKind::Beacon, vec![]).encode();
        assert!(Frame::decode(&bytes[..HEADER_LEN]).is_err());
    }

    #[test]
    fn test_tampered_payload_changes_signing_bytes() {
        // Flipping a payload byte must alter the signed input, so signature
        // verification downstream fails rather than silently accepting.
        let frame = sample_frame(FrameKind::Gossip, vec![0u8; 16]);
        let clean = frame.to_signing_bytes();

        let mut bytes = frame.encode();
        bytes[HEADER_LEN + 2] ^= 0xFF;
        let tampered = Frame::decode(&bytes).unwrap();
        assert_ne!(tampered.to_signing_bytes(), clean);
    }

    #[test]
    fn test_stream_framing_round_trip() {
        let frame = sample_frame(FrameKind::Gossip, vec![5; 8]);
        let mut buf = encode_stream(&frame);
        buf.extend_from_slice(&encode_stream(&frame));

        let first = decode_stream(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, vec![5; 8]);
        let second = decode_stream(&mut buf).unwrap().unwrap();
        assert_eq!(second.nonce, 41);
        assert!(decode_stream(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_stream_waits_for_more() {
        let frame = sample_frame(FrameKind::Beacon, vec![1]);
        let full = encode_stream(&frame);
        let mut buf = full[..full.len() - 3].to_vec();
        assert!(decode_stream(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[full.len() - 3..]);
        assert!(decode_stream(&mut buf).unwrap().is_some());
    }
}
