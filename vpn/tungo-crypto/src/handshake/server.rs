// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    handshake::{
        cookie::{CookieManager, LoadMonitor},
        AllowedPeer, AllowedPeersLookup, Error, Identity, Message, Outcome, SessionGrant,
        MAX_MESSAGE_LEN, NOISE_PARAMS,
    },
    rekey::EpochKeys,
    KEY_LEN,
};
use core::net::IpAddr;

/// Result of reading a client's first message
pub enum ReadOutcome {
    /// The client must retry with this encoded challenge's cookie
    CookieRequired(Vec<u8>),
    /// The client is known; the registrar decides what to grant it
    Accepted(PendingSession),
}

/// Responder side of the handshake.
///
/// Stateless between connections; all of the per-connection state lives in
/// the [`PendingSession`] returned by [`Responder::read_init`].
pub struct Responder<'a> {
    identity: &'a Identity,
    peers: &'a dyn AllowedPeersLookup,
    cookies: &'a CookieManager,
    load: &'a dyn LoadMonitor,
}

impl<'a> Responder<'a> {
    pub fn new(
        identity: &'a Identity,
        peers: &'a dyn AllowedPeersLookup,
        cookies: &'a CookieManager,
        load: &'a dyn LoadMonitor,
    ) -> Self {
        Self {
            identity,
            peers,
            cookies,
            load,
        }
    }

    /// Consumes the client's `Init` message.
    ///
    /// Cookie enforcement happens before the Noise message is touched; no
    /// asymmetric work is spent on a sender that has not proven it can
    /// receive at its claimed source address.
    pub fn read_init(&self, source: IpAddr, message: &[u8]) -> Result<ReadOutcome, Error> {
        let Message::Init { cookie, noise } = Message::decode(message)? else {
            return Err(Error::Malformed);
        };

        if self.peers.is_empty() {
            return Err(Error::MissingAllowedPeers);
        }

        if self.load.high_load() && !self.cookies.verify(source, cookie) {
            let challenge = Message::encode_cookie(&self.cookies.issue(source));
            return Ok(ReadOutcome::CookieRequired(challenge));
        }

        let mut state = snow::Builder::new(
            NOISE_PARAMS.parse().expect("noise pattern is well formed"),
        )
        .local_private_key(self.identity.secret())
        .build_responder()
        .map_err(|_| Error::HandshakeFailed)?;

        let mut payload = [0u8; MAX_MESSAGE_LEN];
        state
            .read_message(noise, &mut payload)
            .map_err(|_| Error::HandshakeFailed)?;

        let public_key: [u8; KEY_LEN] = state
            .get_remote_static()
            .ok_or(Error::HandshakeFailed)?
            .try_into()
            .map_err(|_| Error::HandshakeFailed)?;

        let peer = self
            .peers
            .find(&public_key)
            .filter(|peer| peer.enabled)
            .ok_or(Error::UnknownPeer)?;

        Ok(ReadOutcome::Accepted(PendingSession {
            state,
            peer,
            public_key,
        }))
    }
}

/// An authenticated client waiting for its session grant
pub struct PendingSession {
    state: snow::HandshakeState,
    peer: AllowedPeer,
    public_key: [u8; KEY_LEN],
}

impl PendingSession {
    #[inline]
    pub fn peer(&self) -> &AllowedPeer {
        &self.peer
    }

    #[inline]
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public_key
    }

    /// Seals `grant` into the `Resp` message and splits the session keys.
    ///
    /// Returns the encoded reply and the completed outcome.
    pub fn finish(mut self, grant: SessionGrant) -> Result<(Vec<u8>, Outcome), Error> {
        let payload = grant.encode();
        let mut noise = [0u8; MAX_MESSAGE_LEN];
        let len = self
            .state
            .write_message(&payload, &mut noise)
            .map_err(|_| Error::HandshakeFailed)?;
        let reply = Message::encode_resp(&noise[..len]);

        debug_assert!(self.state.is_handshake_finished());
        let (client_to_server, server_to_client) = self.state.dangerously_get_raw_split();

        let outcome = Outcome {
            client_id: self.peer.client_id,
            public_key: self.public_key,
            keys: EpochKeys::new(client_to_server, server_to_client),
            allowed_ips: self.peer.allowed_ips,
            grant,
        };
        Ok((reply, outcome))
    }
}
