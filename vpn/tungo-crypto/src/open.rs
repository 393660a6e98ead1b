// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receiving half of one epoch's directional key.

use crate::{cipher::Cipher, seal::nonce_counter, Key};
use tungo_core::{
    packet::{NONCE_LEN, TAG_LEN},
    replay::{ReplayError, ReplayWindow},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    /// The nonce was already accepted, or is too old to classify
    #[error("nonce was already accepted within this epoch")]
    NonUniqueNonce,
    /// AEAD verification failed
    #[error("payload failed authentication")]
    AuthenticationFailed,
    /// The sealed payload is shorter than a tag
    #[error("sealed payload is truncated")]
    Truncated,
}

/// Opens payloads under one key, rejecting replays.
///
/// Replay classification happens twice: a cheap pre-check before the AEAD
/// runs, and the authoritative window update after authentication succeeds,
/// so forged nonces can never advance the window.
#[derive(Debug)]
pub struct Opener {
    cipher: Cipher,
    replay: ReplayWindow,
}

impl Opener {
    pub(crate) fn new(key: &Key) -> Self {
        Self {
            cipher: Cipher::new(key),
            replay: ReplayWindow::default(),
        }
    }

    /// Opens `sealed` (ciphertext followed by the tag) in place and returns
    /// the plaintext length.
    #[inline]
    pub fn open(
        &mut self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &mut [u8],
    ) -> Result<usize, OpenError> {
        if sealed.len() < TAG_LEN {
            return Err(OpenError::Truncated);
        }

        let counter = nonce_counter(nonce);
        if self.replay.check(counter).is_err() {
            return Err(OpenError::NonUniqueNonce);
        }

        let payload_len = sealed.len() - TAG_LEN;
        let (payload, tag) = sealed.split_at_mut(payload_len);
        let tag: [u8; TAG_LEN] = (&*tag).try_into().expect("tag length is fixed");

        self.cipher
            .open(nonce, aad, payload, &tag)
            .map_err(|_| OpenError::AuthenticationFailed)?;

        match self.replay.insert(counter) {
            Ok(()) => Ok(payload_len),
            Err(ReplayError::Duplicate | ReplayError::TooOld) => Err(OpenError::NonUniqueNonce),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{seal::Sealer, Key};

    fn pair() -> (Sealer, Opener) {
        let key = Key::new([3; 32]);
        (Sealer::new(&key), Opener::new(&key))
    }

    #[test]
    fn seal_open_round_trip() {
        let (mut sealer, mut opener) = pair();
        let mut buffer = *b"hello world.....----------------";
        let payload_len = 12;

        let (nonce, tag) = sealer.seal(b"aad", &mut buffer[..payload_len]).unwrap();
        buffer[payload_len..payload_len + TAG_LEN].copy_from_slice(&tag);

        let sealed = &mut buffer[..payload_len + TAG_LEN];
        let opened = opener.open(&nonce, b"aad", sealed).unwrap();
        assert_eq!(opened, payload_len);
        assert_eq!(&sealed[..opened], b"hello world.");
    }

    #[test]
    fn replayed_nonces_are_rejected() {
        let (mut sealer, mut opener) = pair();
        let mut buffer = [0u8; 4 + TAG_LEN];
        let (nonce, tag) = sealer.seal(&[], &mut buffer[..4]).unwrap();
        buffer[4..].copy_from_slice(&tag);

        let mut replayed = buffer;
        opener.open(&nonce, &[], &mut buffer).unwrap();
        assert_eq!(
            opener.open(&nonce, &[], &mut replayed),
            Err(OpenError::NonUniqueNonce)
        );
    }

    #[test]
    fn tampered_payloads_fail_authentication() {
        let (mut sealer, mut opener) = pair();
        let mut buffer = [0u8; 4 + TAG_LEN];
        let (nonce, tag) = sealer.seal(&[], &mut buffer[..4]).unwrap();
        buffer[4..].copy_from_slice(&tag);
        buffer[0] ^= 1;

        assert_eq!(
            opener.open(&nonce, &[], &mut buffer),
            Err(OpenError::AuthenticationFailed)
        );
    }

    #[test]
    fn wrong_aad_fails_authentication() {
        let (mut sealer, mut opener) = pair();
        let mut buffer = [0u8; 4 + TAG_LEN];
        let (nonce, tag) = sealer.seal(b"route-1", &mut buffer[..4]).unwrap();
        buffer[4..].copy_from_slice(&tag);

        assert_eq!(
            opener.open(&nonce, b"route-2", &mut buffer),
            Err(OpenError::AuthenticationFailed)
        );
    }

    #[test]
    fn failed_authentication_does_not_advance_the_window() {
        let (mut sealer, mut opener) = pair();
        let mut buffer = [0u8; 4 + TAG_LEN];
        let (nonce, tag) = sealer.seal(&[], &mut buffer[..4]).unwrap();

        // forged copy first
        let mut forged = buffer;
        forged[0] ^= 0xff;
        assert_eq!(
            opener.open(&nonce, &[], &mut forged),
            Err(OpenError::AuthenticationFailed)
        );

        // the genuine envelope still opens
        buffer[4..].copy_from_slice(&tag);
        assert!(opener.open(&nonce, &[], &mut buffer).is_ok());
    }
}
