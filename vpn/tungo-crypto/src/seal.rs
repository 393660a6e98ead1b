// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sending half of one epoch's directional key.

use crate::{cipher::Cipher, Key};
use tungo_core::packet::{NONCE_LEN, TAG_LEN};

/// The counter stops short of the full u64 range so a rekey can be requested
/// and completed before the space is truly spent.
const EXHAUSTION_MARGIN: u64 = 1 << 12;

/// Counter value past which the sender should ask for a fresh epoch
const REKEY_WATERMARK: u64 = u64::MAX - EXHAUSTION_MARGIN - (1 << 20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    /// The nonce counter for this epoch is spent
    #[error("nonce counter exhausted for this epoch")]
    NonceExhausted,
}

/// Seals payloads under one key with a strictly increasing nonce counter.
///
/// The counter occupies the low 8 bytes of the 12-byte wire nonce in network
/// order, so wire nonces within an epoch are strictly increasing when
/// compared big-endian.
#[derive(Debug)]
pub struct Sealer {
    cipher: Cipher,
    counter: u64,
}

impl Sealer {
    pub(crate) fn new(key: &Key) -> Self {
        Self {
            cipher: Cipher::new(key),
            counter: 0,
        }
    }

    /// Seals `payload` in place, returning the nonce to put on the wire and
    /// the detached tag.
    #[inline]
    pub fn seal(
        &mut self,
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<([u8; NONCE_LEN], [u8; TAG_LEN]), SealError> {
        let nonce = self.next_nonce()?;
        let tag = self
            .cipher
            .seal(&nonce, aad, payload)
            // the only failure mode is payload length overflow, which the
            // MTU bound rules out
            .map_err(|_| SealError::NonceExhausted)?;
        Ok((nonce, tag))
    }

    /// Whether this epoch is close enough to exhaustion that a rekey should
    /// be initiated now.
    #[inline]
    pub fn should_rekey(&self) -> bool {
        self.counter >= REKEY_WATERMARK
    }

    #[inline]
    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], SealError> {
        if self.counter >= u64::MAX - EXHAUSTION_MARGIN {
            return Err(SealError::NonceExhausted);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[NONCE_LEN - 8..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&mut self, counter: u64) {
        self.counter = counter;
    }
}

/// Reads the counter back out of a wire nonce
#[inline]
pub fn nonce_counter(nonce: &[u8; NONCE_LEN]) -> u64 {
    let tail: [u8; 8] = nonce[NONCE_LEN - 8..]
        .try_into()
        .expect("nonce tail length is fixed");
    u64::from_be_bytes(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> Sealer {
        Sealer::new(&Key::new([7; 32]))
    }

    #[test]
    fn nonces_are_strictly_increasing_big_endian() {
        let mut sealer = sealer();
        let mut previous = None;
        for _ in 0..64 {
            let (nonce, _) = sealer.seal(&[], &mut []).unwrap();
            if let Some(previous) = previous {
                assert!(nonce > previous, "{nonce:?} not above {previous:?}");
            }
            previous = Some(nonce);
        }
    }

    #[test]
    fn counter_round_trips_through_the_nonce() {
        let mut sealer = sealer();
        sealer.set_counter(0x0102_0304_0506_0708);
        let (nonce, _) = sealer.seal(&[], &mut []).unwrap();
        assert_eq!(nonce_counter(&nonce), 0x0102_0304_0506_0708);
    }

    #[test]
    fn exhaustion_is_reported_before_the_counter_wraps() {
        let mut sealer = sealer();
        sealer.set_counter(u64::MAX - EXHAUSTION_MARGIN);
        assert_eq!(sealer.seal(&[], &mut []), Err(SealError::NonceExhausted));
    }

    #[test]
    fn rekey_watermark_precedes_exhaustion() {
        let mut sealer = sealer();
        assert!(!sealer.should_rekey());
        sealer.set_counter(REKEY_WATERMARK);
        assert!(sealer.should_rekey());
        assert!(sealer.seal(&[], &mut []).is_ok());
    }
}
