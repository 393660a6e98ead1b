// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    handshake::{Error, Identity, Message, SessionGrant, MAX_MESSAGE_LEN, NOISE_PARAMS},
    rekey::EpochKeys,
    KEY_LEN,
};

/// What the server's reply resolved to
pub enum ClientOutcome {
    /// Retry [`Initiator::start`] carrying this cookie
    CookieChallenge(Vec<u8>),
    /// The tunnel is up
    Established {
        keys: EpochKeys,
        grant: SessionGrant,
    },
}

/// Initiator side of the handshake.
///
/// A cookie challenge invalidates the Noise state, so each attempt builds a
/// fresh initiator; the retry passes the challenge's cookie into
/// [`Initiator::start`].
pub struct Initiator {
    state: snow::HandshakeState,
}

impl Initiator {
    /// Builds the `Init` message toward `server_public`.
    ///
    /// Returns the initiator holding the in-flight Noise state and the
    /// encoded message to send.
    pub fn start(
        identity: &Identity,
        server_public: &[u8; KEY_LEN],
        cookie: Option<&[u8]>,
    ) -> Result<(Self, Vec<u8>), Error> {
        let mut state = snow::Builder::new(
            NOISE_PARAMS.parse().expect("noise pattern is well formed"),
        )
        .local_private_key(identity.secret())
        .remote_public_key(server_public)
        .build_initiator()
        .map_err(|_| Error::HandshakeFailed)?;

        let mut noise = [0u8; MAX_MESSAGE_LEN];
        let len = state
            .write_message(&[], &mut noise)
            .map_err(|_| Error::HandshakeFailed)?;
        let message = Message::encode_init(cookie.unwrap_or(&[]), &noise[..len]);
        Ok((Self { state }, message))
    }

    /// Consumes the server's reply.
    ///
    /// `CookieChallenge` means the attempt was shed under load; anything
    /// else completes or fails the handshake.
    pub fn read_reply(mut self, reply: &[u8]) -> Result<ClientOutcome, Error> {
        match Message::decode(reply)? {
            Message::Cookie { cookie } => Ok(ClientOutcome::CookieChallenge(cookie.to_vec())),
            Message::Resp { noise } => {
                let mut payload = [0u8; MAX_MESSAGE_LEN];
                let len = self
                    .state
                    .read_message(noise, &mut payload)
                    .map_err(|_| Error::HandshakeFailed)?;
                let grant = SessionGrant::decode(&payload[..len])?;

                debug_assert!(self.state.is_handshake_finished());
                let (client_to_server, server_to_client) =
                    self.state.dangerously_get_raw_split();

                Ok(ClientOutcome::Established {
                    keys: EpochKeys::new(client_to_server, server_to_client),
                    grant,
                })
            }
            Message::Init { .. } => Err(Error::Malformed),
        }
    }
}
