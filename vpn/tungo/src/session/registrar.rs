// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Binds a handshake outcome to a live peer.
//!
//! The registrar is the only writer that creates peers: it resolves the
//! client's record, allocates the internal addresses and the datagram
//! route-id, completes the handshake with the session grant and installs
//! the peer in the repository, displacing any previous session on the same
//! internal address.

use crate::{
    config::PeerDirectory,
    dataplane::Egress,
    session::{Peer, PeerInfo, SessionRepository},
    Transport,
};
use core::net::IpAddr;
use rand::Rng;
use std::{net::SocketAddr, sync::Arc};
use tungo_core::{inet::AllowedSources, packet::datagram::HANDSHAKE_ROUTE_ID};
use tungo_crypto::{
    endpoint::Role,
    handshake::{
        self, CookieManager, Identity, InFlightHandshakes, ReadOutcome, Responder, SessionGrant,
    },
    session::CryptoSession,
};

/// Result of feeding one handshake message to the registrar
pub enum Registration {
    /// Send this challenge back; the client retries with the cookie
    CookieRequired(Vec<u8>),
    /// Send the reply; the peer is installed and live
    Established { reply: Vec<u8>, peer: Arc<Peer> },
}

pub struct Registrar {
    identity: Identity,
    directory: PeerDirectory,
    cookies: Arc<CookieManager>,
    load: Arc<InFlightHandshakes>,
    repository: Arc<SessionRepository>,
    ipv4_subnet: tungo_core::inet::Cidr,
    ipv6_subnet: Option<tungo_core::inet::Cidr>,
}

impl Registrar {
    pub fn new(
        identity: Identity,
        directory: PeerDirectory,
        cookies: Arc<CookieManager>,
        load: Arc<InFlightHandshakes>,
        repository: Arc<SessionRepository>,
        ipv4_subnet: tungo_core::inet::Cidr,
        ipv6_subnet: Option<tungo_core::inet::Cidr>,
    ) -> Self {
        Self {
            identity,
            directory,
            cookies,
            load,
            repository,
            ipv4_subnet,
            ipv6_subnet,
        }
    }

    #[inline]
    pub fn cookies(&self) -> &Arc<CookieManager> {
        &self.cookies
    }

    /// Processes a client's `Init` message arriving on `transport` from
    /// `external`, with `egress` already bound to the connection.
    pub fn register(
        &self,
        transport: Transport,
        external: SocketAddr,
        egress: Egress,
        message: &[u8],
    ) -> Result<Registration, handshake::Error> {
        let _in_flight = self.load.begin();
        let responder = Responder::new(
            &self.identity,
            &self.directory,
            &self.cookies,
            self.load.as_ref(),
        );

        let pending = match responder.read_init(external.ip(), message)? {
            ReadOutcome::CookieRequired(challenge) => {
                tracing::debug!(source = %external, "handshake challenged under load");
                return Ok(Registration::CookieRequired(challenge));
            }
            ReadOutcome::Accepted(pending) => pending,
        };

        let record = pending.peer();
        let client_id = record.client_id;
        let ipv4 = self
            .ipv4_subnet
            .host_at(client_id as u32 + 1)
            .and_then(|addr| match addr {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or(handshake::Error::HandshakeFailed)?;
        let ipv6 = self.ipv6_subnet.and_then(|subnet| {
            subnet
                .host_at(client_id as u32 + 1)
                .and_then(|addr| match addr {
                    IpAddr::V6(v6) => Some(v6),
                    IpAddr::V4(_) => None,
                })
        });
        let route_id = (transport == Transport::Udp).then(|| self.allocate_route_id());

        let grant = SessionGrant {
            ipv4,
            ipv6,
            route_id: route_id.unwrap_or(HANDSHAKE_ROUTE_ID),
        };
        let (reply, outcome) = pending.finish(grant)?;

        let info = PeerInfo {
            client_id,
            public_key: outcome.public_key,
            internal_ipv4: ipv4,
            internal_ipv6: ipv6,
            route_id,
            allowed_sources: AllowedSources::new(outcome.allowed_ips.clone()),
            transport,
        };
        let crypto = CryptoSession::new(Role::Server, &outcome.keys);
        let peer = Peer::new(info, external, crypto, egress);
        self.repository.add(peer.clone());

        tracing::info!(
            client_id,
            internal = %ipv4,
            external = %external,
            ?transport,
            "peer registered"
        );
        Ok(Registration::Established { reply, peer })
    }

    /// A nonzero route-id no live peer is using
    fn allocate_route_id(&self) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u64 = rng.gen();
            if candidate == HANDSHAKE_ROUTE_ID {
                continue;
            }
            if self.repository.get_by_route_id(candidate).is_none() {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigurationManager, PeerDirectory, StaticConfiguration};
    use tokio::sync::mpsc;
    use tungo_crypto::handshake::{
        cookie::DEFAULT_COOKIE_TTL, AllowedPeer, ClientOutcome, Initiator,
    };

    fn registrar(client: &Identity, server: Identity) -> (Registrar, Arc<SessionRepository>) {
        let repository = SessionRepository::new();
        let settings = crate::config::Settings {
            host: "::".parse().unwrap(),
            protocols: crate::config::Protocols {
                tcp: Some(0),
                udp: Some(0),
                ws: None,
            },
            mtu: 1500,
            x25519_private: [9; 32],
            ipv4_subnet: "10.8.0.0/24".parse().unwrap(),
            ipv6_subnet: Some("fd00::/64".parse().unwrap()),
            allowed_peers: vec![],
            timers: Default::default(),
            handshake_load_threshold: 64,
        };
        let config = StaticConfiguration::new(settings);
        config.update_peers(vec![AllowedPeer {
            name: "alpha".into(),
            public_key: client.public(),
            enabled: true,
            client_id: 1,
            allowed_ips: vec!["10.8.0.2/32".parse().unwrap()],
        }]);
        let registrar = Registrar::new(
            server,
            PeerDirectory::new(config.peer_revisions()),
            Arc::new(CookieManager::new(DEFAULT_COOKIE_TTL)),
            Arc::new(InFlightHandshakes::new(64)),
            repository.clone(),
            "10.8.0.0/24".parse().unwrap(),
            Some("fd00::/64".parse().unwrap()),
        );
        (registrar, repository)
    }

    #[tokio::test]
    async fn registration_allocates_addresses_and_installs_the_peer() {
        let client = Identity::generate();
        let server = Identity::generate();
        let server_public = server.public();
        let (registrar, repository) = registrar(&client, server);

        let (initiator, init) = Initiator::start(&client, &server_public, None).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let registration = registrar
            .register(
                Transport::Tcp,
                "203.0.113.5:50000".parse().unwrap(),
                Egress::stream(tx),
                &init,
            )
            .unwrap();

        let Registration::Established { reply, peer } = registration else {
            panic!("expected an established session");
        };
        assert_eq!(peer.info().internal_ipv4.octets(), [10, 8, 0, 2]);
        assert_eq!(peer.info().internal_ipv6, Some("fd00::2".parse().unwrap()));
        assert!(peer.info().route_id.is_none());
        assert_eq!(repository.len(), 1);

        // the client's half agrees on the grant
        match initiator.read_reply(&reply).unwrap() {
            ClientOutcome::Established { grant, .. } => {
                assert_eq!(grant.ipv4.octets(), [10, 8, 0, 2]);
                assert_eq!(grant.ipv6, Some("fd00::2".parse().unwrap()));
            }
            ClientOutcome::CookieChallenge(_) => panic!("unexpected challenge"),
        }
    }

    #[tokio::test]
    async fn udp_registrations_draw_a_nonzero_route_id() {
        let client = Identity::generate();
        let server = Identity::generate();
        let server_public = server.public();
        let (registrar, repository) = registrar(&client, server);

        let (_initiator, init) = Initiator::start(&client, &server_public, None).unwrap();
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let registration = registrar
            .register(
                Transport::Udp,
                "203.0.113.5:50000".parse().unwrap(),
                Egress::datagram(socket),
                &init,
            )
            .unwrap();

        let Registration::Established { peer, .. } = registration else {
            panic!("expected an established session");
        };
        let route_id = peer.info().route_id.unwrap();
        assert_ne!(route_id, HANDSHAKE_ROUTE_ID);
        assert!(repository.get_by_route_id(route_id).is_some());
    }

    #[tokio::test]
    async fn a_second_registration_displaces_the_first() {
        let client = Identity::generate();
        let server = Identity::generate();
        let server_public = server.public();
        let (registrar, repository) = registrar(&client, server);

        let mut peers = vec![];
        for port in [50000u16, 50001] {
            let (_initiator, init) = Initiator::start(&client, &server_public, None).unwrap();
            let (tx, _rx) = mpsc::channel(4);
            let registration = registrar
                .register(
                    Transport::Tcp,
                    format!("203.0.113.5:{port}").parse().unwrap(),
                    Egress::stream(tx),
                    &init,
                )
                .unwrap();
            let Registration::Established { peer, .. } = registration else {
                panic!("expected an established session");
            };
            peers.push(peer);
        }

        assert!(peers[0].is_closed());
        assert!(!peers[1].is_closed());
        assert_eq!(repository.len(), 1);
    }
}
