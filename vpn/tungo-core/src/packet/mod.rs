// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire envelope layouts shared by every transport.
//!
//! Stream transports (TCP, WebSocket) carry `[epoch:2][nonce:12][ct][tag:16]`
//! inside whatever outer framing the transport provides. Datagram transports
//! prepend an 8-byte route-id so the receiver can dispatch to a peer before
//! spending any crypto: `[route-id:8][epoch:2][nonce:12][ct][tag:16]`.

use core::fmt;
use s2n_codec::{decoder_value, DecoderError, Encoder, EncoderValue};

pub mod datagram;
pub mod frame;
pub mod service;

/// Length of the Poly1305 authentication tag appended to every envelope
pub const TAG_LEN: usize = 16;

/// Length of the AEAD nonce carried on the wire
pub const NONCE_LEN: usize = 12;

/// Length of the big-endian epoch prefix
pub const EPOCH_LEN: usize = 2;

/// Length of the big-endian datagram route-id prefix
pub const ROUTE_ID_LEN: usize = 8;

/// A 16-bit key generation number.
///
/// Epoch 0 is established by the handshake; every completed rekey installs
/// the next epoch. Old epochs remain valid for receive until evicted, so a
/// frame always names the epoch it was sealed under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u16);

impl Epoch {
    pub const ZERO: Self = Self(0);

    /// Rekeying stops before the u16 space is exhausted so in-flight epochs
    /// can never collide with a restarted session.
    pub const MAX_REKEY: u16 = 65000;

    #[inline]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the epoch a rekey would install, or `None` once the rekey
    /// space is exhausted and the session must be re-established.
    #[inline]
    pub const fn next(self) -> Option<Self> {
        if self.0 >= Self::MAX_REKEY {
            None
        } else {
            Some(Self(self.0 + 1))
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u16> for Epoch {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

decoder_value!(
    impl<'a> Epoch {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (value, buffer) = buffer.decode::<u16>()?;
            Ok((Self(value), buffer))
        }
    }
);

impl EncoderValue for Epoch {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        self.0.encode(encoder);
    }
}

/// Errors surfaced while decoding a wire envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is truncated")]
    Truncated,
}

impl From<DecoderError> for EnvelopeError {
    #[inline]
    fn from(_: DecoderError) -> Self {
        Self::Truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_next_stops_at_rekey_limit() {
        assert_eq!(Epoch::new(0).next(), Some(Epoch::new(1)));
        assert_eq!(Epoch::new(64999).next(), Some(Epoch::new(65000)));
        assert_eq!(Epoch::new(65000).next(), None);
        assert_eq!(Epoch::new(u16::MAX).next(), None);
    }
}
