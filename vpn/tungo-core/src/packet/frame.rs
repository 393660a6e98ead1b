// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream envelope: the unit carried by TCP (behind a 2-byte length prefix)
//! and by WebSocket (one binary message per envelope).

use crate::packet::{EnvelopeError, Epoch, EPOCH_LEN, NONCE_LEN, TAG_LEN};
use s2n_codec::{DecoderBufferMut, Encoder, EncoderBuffer};

/// Decoded view of a sealed stream envelope.
///
/// `sealed` borrows the ciphertext and trailing tag in place so the opener
/// can decrypt without copying.
#[derive(Debug)]
pub struct Frame<'a> {
    pub epoch: Epoch,
    pub nonce: [u8; NONCE_LEN],
    pub sealed: &'a mut [u8],
}

impl<'a> Frame<'a> {
    /// Bytes preceding the ciphertext
    pub const HEADER_LEN: usize = EPOCH_LEN + NONCE_LEN;

    /// Total per-envelope expansion over the plaintext
    pub const OVERHEAD: usize = Self::HEADER_LEN + TAG_LEN;

    #[inline]
    pub fn decode(bytes: &'a mut [u8]) -> Result<Self, EnvelopeError> {
        let buffer = DecoderBufferMut::new(bytes);
        let (epoch, buffer) = buffer.decode::<Epoch>()?;
        let (nonce, buffer) = buffer.decode_slice(NONCE_LEN)?;
        let nonce = nonce
            .freeze()
            .into_less_safe_slice()
            .try_into()
            .expect("nonce slice length is fixed");
        let sealed = buffer.into_less_safe_slice();
        if sealed.len() < TAG_LEN {
            return Err(EnvelopeError::Truncated);
        }
        Ok(Self {
            epoch,
            nonce,
            sealed,
        })
    }

    /// Writes the envelope header into the first [`Self::HEADER_LEN`] bytes
    /// of `dst`. The caller seals the payload that follows.
    #[inline]
    pub fn encode_header(dst: &mut [u8], epoch: Epoch, nonce: &[u8; NONCE_LEN]) {
        debug_assert!(dst.len() >= Self::HEADER_LEN);
        let mut encoder = EncoderBuffer::new(dst);
        encoder.encode(&epoch);
        encoder.write_slice(nonce);
    }
}
