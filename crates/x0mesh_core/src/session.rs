//! Per-peer session state.
//!
//! A session owns the derived symmetric secret, the outbound nonce counter
//! and its rotation slot. The inbound anti-replay window lives on the peer
//! (it must exist from first beacon, before any session is negotiated).

use zeroize::Zeroize;

use crate::error::MeshError;
use crate::pqc::SharedSecret;
use crate::types::Slot;

/// Width of the sliding receive window in nonces.
pub const RECV_WINDOW_BITS: u64 = 1_024;

/// Rotation must fire before the nonce space can be exhausted.
pub const NONCE_ROTATION_LIMIT: u64 = 1 << 60;

/// Sliding 1024-bit receive window over inbound nonces.
///
/// Accepts a nonce when it is above the highest seen, or inside the window
/// with its bit still clear. Everything at or below the window floor is a
/// replay or too old, and is rejected.
#[derive(Debug, Clone, Default)]
pub struct RecvWindow {
    highest: u64,
    seen_any: bool,
    /// Bit i tracks nonce `highest - i`.
    bits: [u64; (RECV_WINDOW_BITS / 64) as usize],
}

impl RecvWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest(&self) -> Option<u64> {
        self.seen_any.then_some(self.highest)
    }

    fn bit_set(&self, offset: u64) -> bool {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        self.bits[word] & (1u64 << bit) != 0
    }

    fn set_bit(&mut self, offset: u64) {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        self.bits[word] |= 1u64 << bit;
    }

    fn shift(&mut self, by: u64) {
        if by >= RECV_WINDOW_BITS {
            self.bits = Default::default();
            return;
        }
        let words = (by / 64) as usize;
        let bits = (by % 64) as u32;
        let len = self.bits.len();

        // Words move toward higher offsets; bit 0 is the newest nonce.
        if words > 0 {
            for i in (words..len).rev() {
                self.bits[i] = self.bits[i - words];
            }
            for w in self.bits.iter_mut().take(words) {
                *w = 0;
            }
        }
        if bits > 0 {
            for i in (0..len).rev() {
                let carried = if i > 0 { self.bits[i - 1] >> (64 - bits) } else { 0 };
                self.bits[i] = (self.bits[i] << bits) | carried;
            }
        }
    }

    /// Check and record a nonce. Errors on replays and on nonces that fell
    /// out of the window.
    pub fn accept(&mut self, nonce: u64) -> Result<(), MeshError> {
        if !self.seen_any {
            self.seen_any = true;
            self.highest = nonce;
            self.set_bit(0);
            return Ok(());
        }

        if nonce > self.highest {
            let advance = nonce - self.highest;
            self.shift(advance);
            self.highest = nonce;
            self.set_bit(0);
            return Ok(());
        }

        let offset = self.highest - nonce;
        if offset >= RECV_WINDOW_BITS {
            return Err(MeshError::ReplayDetected { nonce });
        }
        if self.bit_set(offset) {
            return Err(MeshError::ReplayDetected { nonce });
        }
        self.set_bit(offset);
        Ok(())
    }
}

/// Negotiated channel keying material and nonce state.
pub struct Session {
    secret: SharedSecret,
    send_nonce: u64,
    pub rotate_at_slot: Slot,
    pub established_at_slot: Slot,
    /// True for fallback sessions derived without a PQ shared secret.
    pub classical_only: bool,
}

impl Session {
    pub fn new(
        secret: SharedSecret,
        established_at_slot: Slot,
        rotate_at_slot: Slot,
        classical_only: bool,
    ) -> Self {
        Self {
            secret,
            send_nonce: 0,
            rotate_at_slot,
            established_at_slot,
            classical_only,
        }
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    pub fn send_nonce(&self) -> u64 {
        self.send_nonce
    }

    /// Strictly increasing outbound nonce. Exhaustion is unreachable when
    /// rotation policy holds; the error is the belt alongside it.
    pub fn next_send_nonce(&mut self) -> Result<u64, MeshError> {
        if self.send_nonce >= NONCE_ROTATION_LIMIT {
            return Err(MeshError::NonceExhausted);
        }
        self.send_nonce += 1;
        Ok(self.send_nonce)
    }

    /// Rotation is due by schedule or by nonce usage.
    pub fn needs_rotation(&self, now_slot: Slot) -> bool {
        now_slot >= self.rotate_at_slot || self.send_nonce >= NONCE_ROTATION_LIMIT
    }

    /// Explicit teardown; also runs on drop.
    pub fn destroy(&mut self) {
        self.secret.0.zeroize();
        self.send_nonce = 0;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.secret.0.zeroize();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("send_nonce", &self.send_nonce)
            .field("rotate_at_slot", &self.rotate_at_slot)
            .field("classical_only", &self.classical_only)
            .finish_non_exhaustive()
    }
}
