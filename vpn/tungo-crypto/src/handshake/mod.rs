// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session establishment: Noise IK under a small plaintext envelope.
//!
//! The envelope exists for one reason: the responder must be able to demand
//! a cookie before it spends any asymmetric CPU, and the cookie has to ride
//! outside the Noise messages. Three message types cover the whole exchange:
//!
//! ```text
//! Init   [0x01][cookie_len:1][cookie][noise_len:2 BE][noise msg1]
//! Resp   [0x02][noise_len:2 BE][noise msg2]
//! Cookie [0x03][cookie_len:1][cookie]
//! ```
//!
//! The responder's msg2 payload carries the session grant: the internal
//! addresses the server allocated and the datagram route-id.

use crate::{rekey::EpochKeys, KEY_LEN};
use core::net::{Ipv4Addr, Ipv6Addr};
use s2n_codec::{DecoderBuffer, Encoder, EncoderBuffer};
use std::time::Duration;
use tungo_core::inet::Cidr;
use zeroize::Zeroizing;

pub mod cookie;

mod client;
mod server;

pub use client::{ClientOutcome, Initiator};
pub use cookie::{CookieManager, InFlightHandshakes, LoadMonitor};
pub use server::{PendingSession, ReadOutcome, Responder};

/// The one Noise pattern this system speaks
pub const NOISE_PARAMS: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

/// A handshake that has not completed by this deadline is abandoned
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

/// Upper bound on an encoded handshake message
pub const MAX_MESSAGE_LEN: usize = 1024;

const TAG_INIT: u8 = 0x01;
const TAG_RESP: u8 = 0x02;
const TAG_COOKIE: u8 = 0x03;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("server identity key is not configured")]
    MissingServerKey,
    #[error("no peers are configured")]
    MissingAllowedPeers,
    #[error("peer public key is not authorized")]
    UnknownPeer,
    #[error("a fresh cookie is required")]
    CookieRequired,
    #[error("cookie failed verification")]
    CookieInvalid,
    #[error("noise handshake failed")]
    HandshakeFailed,
    #[error("malformed handshake message")]
    Malformed,
}

/// A long-term X25519 identity keypair
pub struct Identity {
    secret: Zeroizing<[u8; KEY_LEN]>,
    public: [u8; KEY_LEN],
}

impl Identity {
    pub fn new(secret: [u8; KEY_LEN]) -> Self {
        let public = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(secret));
        Self {
            secret: Zeroizing::new(secret),
            public: public.to_bytes(),
        }
    }

    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self::new(secret.to_bytes())
    }

    #[inline]
    pub fn public(&self) -> [u8; KEY_LEN] {
        self.public
    }

    #[inline]
    pub(crate) fn secret(&self) -> &[u8] {
        self.secret.as_ref()
    }
}

impl core::fmt::Debug for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// One authorized peer, as configuration describes it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedPeer {
    pub name: String,
    pub public_key: [u8; KEY_LEN],
    pub enabled: bool,
    pub client_id: i32,
    pub allowed_ips: Vec<Cidr>,
}

/// How the responder resolves a client's static key during the handshake
pub trait AllowedPeersLookup: Send + Sync {
    /// Whether any peers are configured at all
    fn is_empty(&self) -> bool;

    /// The peer record for `public_key`, enabled or not
    fn find(&self, public_key: &[u8; KEY_LEN]) -> Option<AllowedPeer>;
}

/// What the server allocated for this session, delivered inside msg2
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionGrant {
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub route_id: u64,
}

impl SessionGrant {
    const MAX_LEN: usize = 4 + 8 + 1 + 16;

    fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::MAX_LEN];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.write_slice(&self.ipv4.octets());
        encoder.encode(&self.route_id);
        match self.ipv6 {
            Some(ipv6) => {
                encoder.encode(&1u8);
                encoder.write_slice(&ipv6.octets());
            }
            None => encoder.encode(&0u8),
        }
        let len = encoder.len();
        bytes.truncate(len);
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let buffer = DecoderBuffer::new(bytes);
        let (ipv4, buffer) = buffer.decode_slice(4).map_err(|_| Error::Malformed)?;
        let ipv4: [u8; 4] = ipv4
            .into_less_safe_slice()
            .try_into()
            .expect("slice length is fixed");
        let (route_id, buffer) = buffer.decode::<u64>().map_err(|_| Error::Malformed)?;
        let (has_ipv6, buffer) = buffer.decode::<u8>().map_err(|_| Error::Malformed)?;
        let ipv6 = match has_ipv6 {
            0 => {
                buffer.ensure_empty().map_err(|_| Error::Malformed)?;
                None
            }
            1 => {
                let (ipv6, buffer) = buffer.decode_slice(16).map_err(|_| Error::Malformed)?;
                buffer.ensure_empty().map_err(|_| Error::Malformed)?;
                let octets: [u8; 16] = ipv6
                    .into_less_safe_slice()
                    .try_into()
                    .expect("slice length is fixed");
                Some(Ipv6Addr::from(octets))
            }
            _ => return Err(Error::Malformed),
        };
        Ok(Self {
            ipv4: Ipv4Addr::from(ipv4),
            ipv6,
            route_id,
        })
    }
}

/// Keys and grant produced by a completed handshake, plus the peer record
/// the responder resolved.
pub struct Outcome {
    pub client_id: i32,
    pub public_key: [u8; KEY_LEN],
    pub keys: EpochKeys,
    pub allowed_ips: Vec<Cidr>,
    pub grant: SessionGrant,
}

/// Decoded envelope message
pub(crate) enum Message<'a> {
    Init { cookie: &'a [u8], noise: &'a [u8] },
    Resp { noise: &'a [u8] },
    Cookie { cookie: &'a [u8] },
}

impl<'a> Message<'a> {
    pub(crate) fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(Error::Malformed);
        }
        let buffer = DecoderBuffer::new(bytes);
        let (tag, buffer) = buffer.decode::<u8>().map_err(|_| Error::Malformed)?;
        match tag {
            TAG_INIT => {
                let (cookie, buffer) = buffer
                    .decode_slice_with_len_prefix::<u8>()
                    .map_err(|_| Error::Malformed)?;
                let (noise, buffer) = buffer
                    .decode_slice_with_len_prefix::<u16>()
                    .map_err(|_| Error::Malformed)?;
                buffer.ensure_empty().map_err(|_| Error::Malformed)?;
                Ok(Self::Init {
                    cookie: cookie.into_less_safe_slice(),
                    noise: noise.into_less_safe_slice(),
                })
            }
            TAG_RESP => {
                let (noise, buffer) = buffer
                    .decode_slice_with_len_prefix::<u16>()
                    .map_err(|_| Error::Malformed)?;
                buffer.ensure_empty().map_err(|_| Error::Malformed)?;
                Ok(Self::Resp {
                    noise: noise.into_less_safe_slice(),
                })
            }
            TAG_COOKIE => {
                let (cookie, buffer) = buffer
                    .decode_slice_with_len_prefix::<u8>()
                    .map_err(|_| Error::Malformed)?;
                buffer.ensure_empty().map_err(|_| Error::Malformed)?;
                Ok(Self::Cookie {
                    cookie: cookie.into_less_safe_slice(),
                })
            }
            _ => Err(Error::Malformed),
        }
    }

    pub(crate) fn encode_init(cookie: &[u8], noise: &[u8]) -> Vec<u8> {
        debug_assert!(cookie.len() <= u8::MAX as usize);
        let mut bytes = vec![0u8; 1 + 1 + cookie.len() + 2 + noise.len()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&TAG_INIT);
        encoder.encode(&(cookie.len() as u8));
        encoder.write_slice(cookie);
        encoder.encode(&(noise.len() as u16));
        encoder.write_slice(noise);
        bytes
    }

    pub(crate) fn encode_resp(noise: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; 1 + 2 + noise.len()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&TAG_RESP);
        encoder.encode(&(noise.len() as u16));
        encoder.write_slice(noise);
        bytes
    }

    pub(crate) fn encode_cookie(cookie: &[u8]) -> Vec<u8> {
        debug_assert!(cookie.len() <= u8::MAX as usize);
        let mut bytes = vec![0u8; 1 + 1 + cookie.len()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&TAG_COOKIE);
        encoder.encode(&(cookie.len() as u8));
        encoder.write_slice(cookie);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_codec_round_trips() {
        for grant in [
            SessionGrant {
                ipv4: Ipv4Addr::new(10, 8, 0, 2),
                ipv6: None,
                route_id: 42,
            },
            SessionGrant {
                ipv4: Ipv4Addr::new(10, 8, 0, 7),
                ipv6: Some("fd00::7".parse().unwrap()),
                route_id: u64::MAX,
            },
        ] {
            assert_eq!(SessionGrant::decode(&grant.encode()), Ok(grant));
        }
    }

    #[test]
    fn grant_rejects_trailing_bytes() {
        let mut bytes = SessionGrant {
            ipv4: Ipv4Addr::new(10, 8, 0, 2),
            ipv6: None,
            route_id: 1,
        }
        .encode();
        bytes.push(0);
        assert_eq!(SessionGrant::decode(&bytes), Err(Error::Malformed));
    }

    #[test]
    fn envelope_codec_round_trips() {
        let init = Message::encode_init(b"cookie", b"noise-one");
        match Message::decode(&init).unwrap() {
            Message::Init { cookie, noise } => {
                assert_eq!(cookie, b"cookie");
                assert_eq!(noise, b"noise-one");
            }
            _ => panic!("wrong message type"),
        }

        let resp = Message::encode_resp(b"noise-two");
        match Message::decode(&resp).unwrap() {
            Message::Resp { noise } => assert_eq!(noise, b"noise-two"),
            _ => panic!("wrong message type"),
        }

        let challenge = Message::encode_cookie(b"mac");
        match Message::decode(&challenge).unwrap() {
            Message::Cookie { cookie } => assert_eq!(cookie, b"mac"),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn envelope_rejects_bad_tags_and_truncation() {
        assert_eq!(Message::decode(&[]).err(), Some(Error::Malformed));
        assert_eq!(Message::decode(&[0x07]).err(), Some(Error::Malformed));
        let init = Message::encode_init(b"c", b"n");
        assert!(Message::decode(&init[..init.len() - 1]).is_err());
    }
}
