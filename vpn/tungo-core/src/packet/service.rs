// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-band service packets, multiplexed with IP payloads on the encrypted
//! channel.
//!
//! Every decrypted payload is offered to [`ServicePacket::try_parse`] before
//! it is treated as an IP datagram, so the parse has to be cheap and must
//! never error on arbitrary input. Length is the discriminator:
//!
//! ```text
//! [0x01]                      length 1     legacy SessionReset
//! [0xFF][0x01][type]          length 3     Ping / Pong / SessionReset / EpochExhausted
//! [0xFF][0x01][type][pub:32]  length 35    RekeyInit / RekeyAck
//! ```
//!
//! IP packets always start with a version nibble of 4 or 6, so the 0xFF
//! prefix cannot collide with data.

use s2n_codec::{DecoderBuffer, Encoder, EncoderBuffer};

/// First byte of the v1 service header
pub const PREFIX: u8 = 0xff;

/// Second byte of the v1 service header
pub const VERSION: u8 = 0x01;

/// Length of the legacy single-byte encoding
pub const LEGACY_LEN: usize = 1;

/// Length of a v1 packet without a key
pub const HEADER_LEN: usize = 3;

/// Length of a v1 rekey packet
pub const REKEY_LEN: usize = HEADER_LEN + 32;

/// Service packet type discriminants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    SessionReset = 1,
    RekeyInit = 2,
    RekeyAck = 3,
    Ping = 4,
    Pong = 5,
    EpochExhausted = 6,
}

impl Kind {
    #[inline]
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::SessionReset),
            2 => Some(Self::RekeyInit),
            3 => Some(Self::RekeyAck),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            6 => Some(Self::EpochExhausted),
            _ => None,
        }
    }

    /// Whether this kind carries a 32-byte public key
    #[inline]
    pub const fn carries_key(self) -> bool {
        matches!(self, Self::RekeyInit | Self::RekeyAck)
    }
}

/// A parsed service packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServicePacket {
    /// Server-initiated teardown. The legacy single-byte form decodes to the
    /// same variant; [`ServicePacket::try_parse_legacy`] reports which form
    /// was seen for paths that still accept it.
    SessionReset,
    Ping,
    Pong,
    /// The rekey space is spent and the session must be re-established
    EpochExhausted,
    RekeyInit { public_key: [u8; 32] },
    RekeyAck { public_key: [u8; 32] },
}

/// Errors surfaced while encoding a service packet
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("destination buffer is too small")]
    ShortBuffer,
    #[error("packet type cannot be encoded in this form")]
    InvalidHeader,
}

impl ServicePacket {
    /// Parses a decrypted payload as a v1 service packet.
    ///
    /// Returns `None` for anything that is not an exact-length, well-formed
    /// service packet; the caller then treats the payload as data. This is
    /// the fast path taken on every packet, so mismatches are not errors.
    #[inline]
    pub fn try_parse(payload: &[u8]) -> Option<Self> {
        match payload.len() {
            HEADER_LEN | REKEY_LEN => {}
            _ => return None,
        }

        let buffer = DecoderBuffer::new(payload);
        let (prefix, buffer) = buffer.decode::<u8>().ok()?;
        let (version, buffer) = buffer.decode::<u8>().ok()?;
        if prefix != PREFIX || version != VERSION {
            return None;
        }
        let (kind, buffer) = buffer.decode::<u8>().ok()?;
        let kind = Kind::from_byte(kind)?;

        // length must match the kind exactly
        if kind.carries_key() != (payload.len() == REKEY_LEN) {
            return None;
        }

        match kind {
            Kind::SessionReset => Some(Self::SessionReset),
            Kind::Ping => Some(Self::Ping),
            Kind::Pong => Some(Self::Pong),
            Kind::EpochExhausted => Some(Self::EpochExhausted),
            Kind::RekeyInit | Kind::RekeyAck => {
                let (key, _) = buffer.decode_slice(32).ok()?;
                let public_key = key
                    .into_less_safe_slice()
                    .try_into()
                    .expect("key slice length is fixed");
                if kind == Kind::RekeyInit {
                    Some(Self::RekeyInit { public_key })
                } else {
                    Some(Self::RekeyAck { public_key })
                }
            }
        }
    }

    /// [`Self::try_parse`] plus the legacy single-byte SessionReset.
    ///
    /// Only the client's datagram ingest still accepts the legacy form;
    /// nothing emits it.
    #[inline]
    pub fn try_parse_legacy(payload: &[u8]) -> Option<Self> {
        if payload.len() == LEGACY_LEN && payload[0] == Kind::SessionReset as u8 {
            return Some(Self::SessionReset);
        }
        Self::try_parse(payload)
    }

    #[inline]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::SessionReset => Kind::SessionReset,
            Self::Ping => Kind::Ping,
            Self::Pong => Kind::Pong,
            Self::EpochExhausted => Kind::EpochExhausted,
            Self::RekeyInit { .. } => Kind::RekeyInit,
            Self::RekeyAck { .. } => Kind::RekeyAck,
        }
    }

    /// The exact number of bytes [`Self::encode`] writes
    #[inline]
    pub const fn encoding_len(&self) -> usize {
        if self.kind().carries_key() {
            REKEY_LEN
        } else {
            HEADER_LEN
        }
    }

    /// Encodes the v1 form into the front of `dst`, returning the written
    /// prefix.
    #[inline]
    pub fn encode<'a>(&self, dst: &'a mut [u8]) -> Result<&'a [u8], EncodeError> {
        let len = self.encoding_len();
        if dst.len() < len {
            return Err(EncodeError::ShortBuffer);
        }

        let mut encoder = EncoderBuffer::new(dst);
        encoder.write_slice(&[PREFIX, VERSION, self.kind() as u8]);
        match self {
            Self::RekeyInit { public_key } | Self::RekeyAck { public_key } => {
                encoder.write_slice(public_key);
            }
            _ => {}
        }
        debug_assert_eq!(encoder.len(), len);
        Ok(&dst[..len])
    }
}

/// Encodes a bare v1 header for kinds that carry no key.
///
/// Rekey kinds need a public key and cannot be expressed in the 3-byte form.
#[inline]
pub fn encode_v1(kind: Kind, dst: &mut [u8]) -> Result<&[u8], EncodeError> {
    if kind.carries_key() {
        return Err(EncodeError::InvalidHeader);
    }
    if dst.len() < HEADER_LEN {
        return Err(EncodeError::ShortBuffer);
    }
    dst[..HEADER_LEN].copy_from_slice(&[PREFIX, VERSION, kind as u8]);
    Ok(&dst[..HEADER_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;

    fn packets() -> Vec<ServicePacket> {
        vec![
            ServicePacket::SessionReset,
            ServicePacket::Ping,
            ServicePacket::Pong,
            ServicePacket::EpochExhausted,
            ServicePacket::RekeyInit {
                public_key: [0xab; 32],
            },
            ServicePacket::RekeyAck {
                public_key: [0xcd; 32],
            },
        ]
    }

    #[test]
    fn encode_parse_round_trip() {
        for packet in packets() {
            let mut dst = [0u8; REKEY_LEN];
            let encoded = packet.encode(&mut dst).unwrap();
            assert_eq!(encoded.len(), packet.encoding_len());
            assert_eq!(ServicePacket::try_parse(encoded), Some(packet));
        }
    }

    #[test]
    fn short_buffer_is_reported() {
        for packet in packets() {
            let mut dst = [0u8; REKEY_LEN];
            let short = &mut dst[..packet.encoding_len() - 1];
            assert_eq!(packet.encode(short), Err(EncodeError::ShortBuffer));
        }
    }

    #[test]
    fn bare_header_refuses_rekey_kinds() {
        let mut dst = [0u8; HEADER_LEN];
        assert_eq!(
            encode_v1(Kind::RekeyInit, &mut dst),
            Err(EncodeError::InvalidHeader)
        );
        assert_eq!(
            encode_v1(Kind::RekeyAck, &mut dst),
            Err(EncodeError::InvalidHeader)
        );
        assert!(encode_v1(Kind::Ping, &mut dst).is_ok());
    }

    #[test]
    fn legacy_reset_is_only_accepted_on_the_legacy_path() {
        let legacy = [Kind::SessionReset as u8];
        assert_eq!(ServicePacket::try_parse(&legacy), None);
        assert_eq!(
            ServicePacket::try_parse_legacy(&legacy),
            Some(ServicePacket::SessionReset)
        );
        // any other single byte is data
        assert_eq!(ServicePacket::try_parse_legacy(&[0x45]), None);
    }

    #[test]
    fn length_is_the_discriminator() {
        // rekey type with a 3-byte length
        assert_eq!(
            ServicePacket::try_parse(&[PREFIX, VERSION, Kind::RekeyInit as u8]),
            None
        );
        // ping padded out to rekey length
        let mut padded = [0u8; REKEY_LEN];
        padded[..3].copy_from_slice(&[PREFIX, VERSION, Kind::Ping as u8]);
        assert_eq!(ServicePacket::try_parse(&padded), None);
        // bad prefix and bad version
        assert_eq!(ServicePacket::try_parse(&[0xfe, VERSION, 4]), None);
        assert_eq!(ServicePacket::try_parse(&[PREFIX, 0x02, 4]), None);
        // unknown type byte
        assert_eq!(ServicePacket::try_parse(&[PREFIX, VERSION, 7]), None);
    }

    #[test]
    fn arbitrary_payloads_never_panic() {
        check!().for_each(|bytes: &[u8]| {
            if let Some(packet) = ServicePacket::try_parse_legacy(bytes) {
                // anything that parses must re-encode to the same v1 bytes,
                // except the legacy single-byte reset
                if bytes.len() != LEGACY_LEN {
                    let mut dst = [0u8; REKEY_LEN];
                    assert_eq!(packet.encode(&mut dst).unwrap(), bytes);
                }
            }
        });
    }
}
