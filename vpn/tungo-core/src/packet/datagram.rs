// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Datagram envelope: one UDP datagram per envelope.
//!
//! The route-id in front of the epoch lets the server pick the owning peer
//! with a single map lookup before any authentication happens. It is bound
//! into the AEAD as associated data, so a forged or reshuffled route-id
//! fails the tag check.

use crate::packet::{EnvelopeError, Epoch, EPOCH_LEN, NONCE_LEN, ROUTE_ID_LEN, TAG_LEN};
use s2n_codec::{DecoderBufferMut, Encoder, EncoderBuffer};

/// Route-id 0 is reserved for handshake envelopes; registered peers always
/// draw a nonzero id.
pub const HANDSHAKE_ROUTE_ID: u64 = 0;

/// Decoded view of a sealed datagram envelope
#[derive(Debug)]
pub struct Datagram<'a> {
    pub route_id: u64,
    pub epoch: Epoch,
    pub nonce: [u8; NONCE_LEN],
    pub sealed: &'a mut [u8],
}

impl<'a> Datagram<'a> {
    /// Bytes preceding the ciphertext
    pub const HEADER_LEN: usize = ROUTE_ID_LEN + EPOCH_LEN + NONCE_LEN;

    /// Total per-envelope expansion over the plaintext
    pub const OVERHEAD: usize = Self::HEADER_LEN + TAG_LEN;

    #[inline]
    pub fn decode(bytes: &'a mut [u8]) -> Result<Self, EnvelopeError> {
        let buffer = DecoderBufferMut::new(bytes);
        let (route_id, buffer) = buffer.decode::<u64>()?;
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
            route_id,
            epoch,
            nonce,
            sealed,
        })
    }

    /// Reads the route-id without touching the rest of the envelope.
    ///
    /// Used on the dispatch path where the datagram may turn out to be a
    /// handshake message rather than a data envelope.
    #[inline]
    pub fn peek_route_id(bytes: &[u8]) -> Option<u64> {
        let prefix: [u8; ROUTE_ID_LEN] = bytes.get(..ROUTE_ID_LEN)?.try_into().ok()?;
        Some(u64::from_be_bytes(prefix))
    }

    /// Writes the envelope header into the first [`Self::HEADER_LEN`] bytes
    /// of `dst`. The caller seals the payload that follows.
    #[inline]
    pub fn encode_header(dst: &mut [u8], route_id: u64, epoch: Epoch, nonce: &[u8; NONCE_LEN]) {
        debug_assert!(dst.len() >= Self::HEADER_LEN);
        let mut encoder = EncoderBuffer::new(dst);
        encoder.encode(&route_id);
        encoder.encode(&epoch);
        encoder.write_slice(nonce);
    }

    /// The associated data covering this datagram's route-id
    #[inline]
    pub fn aad(route_id: u64) -> [u8; ROUTE_ID_LEN] {
        route_id.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_splits_header_and_sealed_payload() {
        let mut bytes = [0u8; Datagram::OVERHEAD + 9];
        Datagram::encode_header(&mut bytes, 0xdead_beef, Epoch::new(3), &[5; NONCE_LEN]);

        let datagram = Datagram::decode(&mut bytes).unwrap();
        assert_eq!(datagram.route_id, 0xdead_beef);
        assert_eq!(datagram.epoch, Epoch::new(3));
        assert_eq!(datagram.nonce, [5; NONCE_LEN]);
        assert_eq!(datagram.sealed.len(), TAG_LEN + 9);
    }

    #[test]
    fn peek_reads_the_route_id_prefix() {
        let mut bytes = [0u8; Datagram::OVERHEAD];
        Datagram::encode_header(&mut bytes, 42, Epoch::ZERO, &[0; NONCE_LEN]);
        assert_eq!(Datagram::peek_route_id(&bytes), Some(42));
        assert_eq!(Datagram::peek_route_id(&bytes[..7]), None);
    }

    #[test]
    fn rejects_envelopes_shorter_than_the_tag() {
        let mut bytes = [0u8; Datagram::OVERHEAD - 1];
        assert!(Datagram::decode(&mut bytes).is_err());
    }
}
