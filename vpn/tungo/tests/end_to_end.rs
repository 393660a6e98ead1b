// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Whole-endpoint scenarios: a real server and client wired through
//! in-memory TUN devices and loopback sockets.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tungo::{
    client::{Client, ClientSettings},
    config::{PeerEntry, Protocols, Settings, StaticConfiguration, Timers},
    server::{Server, ServerHandle},
    tun::testing::{MemoryTun, MemoryTunFactory},
    Transport,
};
use tungo_core::packet::{datagram::HANDSHAKE_ROUTE_ID, Epoch, ROUTE_ID_LEN};
use tungo_crypto::{
    endpoint::Role,
    handshake::{AllowedPeer, ClientOutcome, Identity, Initiator},
    session::CryptoSession,
};

const WAIT: Duration = Duration::from_secs(5);

struct TestNet {
    handle: ServerHandle,
    server_tun: MemoryTun,
    config: Arc<StaticConfiguration>,
    client_identity: Identity,
    server_public: [u8; 32],
    cancel: CancellationToken,
}

fn ipv4_packet(source: Ipv4Addr, destination: Ipv4Addr, body: &[u8]) -> Vec<u8> {
    let total = 20 + body.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 1;
    packet[12..16].copy_from_slice(&source.octets());
    packet[16..20].copy_from_slice(&destination.octets());
    packet[20..].copy_from_slice(body);
    packet
}

fn test_timers() -> Timers {
    Timers {
        rekey_interval: Duration::from_secs(600),
        rekey_timeout: Duration::from_secs(30),
        ping_interval: Duration::from_secs(25),
        ping_restart_timeout: Duration::from_secs(75),
        idle_timeout: Duration::from_secs(300),
    }
}

/// Deterministic keys so the client settings and the server's allowed-peer
/// entry agree.
const CLIENT_PRIVATE: [u8; 32] = [0x77; 32];
const SERVER_PRIVATE: [u8; 32] = [0x40; 32];

async fn start_server(transport: Transport, load_threshold: usize) -> TestNet {
    let client_identity = Identity::new(CLIENT_PRIVATE);
    let server_public = Identity::new(SERVER_PRIVATE).public();

    let protocols = match transport {
        Transport::Tcp => Protocols {
            tcp: Some(0),
            udp: None,
            ws: None,
        },
        Transport::Udp => Protocols {
            tcp: None,
            udp: Some(0),
            ws: None,
        },
        Transport::Ws => Protocols {
            tcp: None,
            udp: None,
            ws: Some(0),
        },
    };

    let settings = Settings {
        host: "127.0.0.1".parse().unwrap(),
        protocols,
        mtu: 1500,
        x25519_private: SERVER_PRIVATE,
        ipv4_subnet: "10.8.0.0/24".parse().unwrap(),
        ipv6_subnet: None,
        allowed_peers: vec![PeerEntry {
            name: "alpha".into(),
            public_key: client_identity.public(),
            enabled: true,
            client_id: 1,
            allowed_ips: vec!["10.8.0.2/32".parse().unwrap()],
        }],
        timers: test_timers(),
        handshake_load_threshold: load_threshold,
    };

    let config = StaticConfiguration::new(settings);
    let factory = Arc::new(MemoryTunFactory::new());
    let cancel = CancellationToken::new();
    let handle = Server::new(config.clone(), factory.clone())
        .spawn(cancel.clone())
        .await
        .expect("server spawns");
    let server_tun = factory.kernel_end(transport).expect("device was created");

    TestNet {
        handle,
        server_tun,
        config,
        client_identity,
        server_public,
        cancel,
    }
}

fn client_settings(net: &TestNet, transport: Transport, timers: Timers) -> ClientSettings {
    ClientSettings {
        transport,
        server_addr: net.handle.local_addr(transport).unwrap(),
        server_public: net.server_public,
        x25519_private: CLIENT_PRIVATE,
        mtu: 1500,
        timers,
    }
}

async fn wait_for_peer(net: &TestNet) {
    timeout(WAIT, async {
        while net.handle.repository().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer registers in time");
}

async fn round_trip(
    net: &mut TestNet,
    client_tun: &mut MemoryTun,
) {
    // client to server
    let up = ipv4_packet(
        Ipv4Addr::new(10, 8, 0, 2),
        Ipv4Addr::new(10, 8, 0, 1),
        &[1, 2, 3, 4, 5, 6, 7, 8],
    );
    client_tun.inject(&up);
    let seen = timeout(WAIT, net.server_tun.outbound())
        .await
        .expect("packet crosses the tunnel")
        .expect("device is open");
    assert_eq!(seen, up);

    // server to client
    let down = ipv4_packet(
        Ipv4Addr::new(10, 8, 0, 1),
        Ipv4Addr::new(10, 8, 0, 2),
        b"pong....",
    );
    net.server_tun.inject(&down);
    let seen = timeout(WAIT, client_tun.outbound())
        .await
        .expect("packet crosses the tunnel")
        .expect("device is open");
    assert_eq!(seen, down);
}

#[tokio::test]
async fn udp_data_round_trip() {
    let mut net = start_server(Transport::Udp, 256).await;
    let (device, mut client_tun) = MemoryTun::pair();
    let client = Client::new(
        client_settings(&net, Transport::Udp, test_timers()),
        Box::new(device),
    );
    let client_cancel = net.cancel.child_token();
    let client_task = tokio::spawn(client.run(client_cancel));

    wait_for_peer(&net).await;
    round_trip(&mut net, &mut client_tun).await;

    net.cancel.cancel();
    let _ = timeout(WAIT, client_task).await;
    net.handle.shutdown().await;
}

#[tokio::test]
async fn unauthorized_sources_never_reach_the_server_tun() {
    let mut net = start_server(Transport::Udp, 256).await;
    let (device, mut client_tun) = MemoryTun::pair();
    let client = Client::new(
        client_settings(&net, Transport::Udp, test_timers()),
        Box::new(device),
    );
    let client_task = tokio::spawn(client.run(net.cancel.child_token()));

    wait_for_peer(&net).await;

    // a source the peer may not claim
    let forged = ipv4_packet(
        Ipv4Addr::new(10, 8, 0, 99),
        Ipv4Addr::new(10, 8, 0, 1),
        b"spoofed.",
    );
    client_tun.inject(&forged);
    assert!(
        timeout(Duration::from_millis(500), net.server_tun.outbound())
            .await
            .is_err(),
        "forged packet must not surface"
    );

    // the session itself is unharmed
    round_trip(&mut net, &mut client_tun).await;

    net.cancel.cancel();
    let _ = timeout(WAIT, client_task).await;
    net.handle.shutdown().await;
}

#[tokio::test]
async fn tcp_round_trip_and_rekey() {
    let mut net = start_server(Transport::Tcp, 256).await;
    let mut timers = test_timers();
    timers.rekey_interval = Duration::from_secs(1);

    let (device, mut client_tun) = MemoryTun::pair();
    let client = Client::new(
        client_settings(&net, Transport::Tcp, timers),
        Box::new(device),
    );
    let client_task = tokio::spawn(client.run(net.cancel.child_token()));

    wait_for_peer(&net).await;
    round_trip(&mut net, &mut client_tun).await;

    // the scheduler fires after a second and both sides move to epoch 1
    let peer = net
        .handle
        .repository()
        .find_by_destination_ip("10.8.0.2".parse().unwrap())
        .unwrap();
    timeout(WAIT, async {
        loop {
            let epoch = peer
                .inspect_crypto(|crypto| crypto.fsm().send_epoch())
                .unwrap_or(Epoch::ZERO);
            if epoch >= Epoch::new(1) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("rekey completes in time");

    // traffic still flows under the new epoch
    round_trip(&mut net, &mut client_tun).await;

    net.cancel.cancel();
    let _ = timeout(WAIT, client_task).await;
    net.handle.shutdown().await;
}

#[tokio::test]
async fn websocket_round_trip() {
    let mut net = start_server(Transport::Ws, 256).await;
    let (device, mut client_tun) = MemoryTun::pair();
    let client = Client::new(
        client_settings(&net, Transport::Ws, test_timers()),
        Box::new(device),
    );
    let client_task = tokio::spawn(client.run(net.cancel.child_token()));

    wait_for_peer(&net).await;
    round_trip(&mut net, &mut client_tun).await;

    net.cancel.cancel();
    let _ = timeout(WAIT, client_task).await;
    net.handle.shutdown().await;
}

#[tokio::test]
async fn epoch_exhaustion_forces_a_fresh_session() {
    let mut net = start_server(Transport::Tcp, 256).await;
    let mut timers = test_timers();
    timers.rekey_interval = Duration::from_secs(1);

    let (device, mut client_tun) = MemoryTun::pair();
    let client = Client::new(
        client_settings(&net, Transport::Tcp, timers),
        Box::new(device),
    );
    let client_task = tokio::spawn(client.run(net.cancel.child_token()));

    wait_for_peer(&net).await;
    let first_peer = net
        .handle
        .repository()
        .find_by_destination_ip("10.8.0.2".parse().unwrap())
        .unwrap();

    // the next rekey attempt finds the epoch space spent
    first_peer
        .with_crypto(|crypto| {
            crypto
                .fsm_mut()
                .force_last_rekey_epoch(Epoch::new(Epoch::MAX_REKEY));
        })
        .unwrap();

    // the client reconnects and the replacement session starts over
    timeout(WAIT, async {
        loop {
            if first_peer.is_closed() {
                let replaced = net
                    .handle
                    .repository()
                    .find_by_destination_ip("10.8.0.2".parse().unwrap());
                if let Some(peer) = replaced {
                    let fresh = peer
                        .inspect_crypto(|crypto| crypto.fsm().last_rekey_epoch())
                        .unwrap_or(Epoch::new(u16::MAX));
                    if fresh <= Epoch::new(1) {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("client re-establishes after exhaustion");

    round_trip(&mut net, &mut client_tun).await;

    net.cancel.cancel();
    let _ = timeout(WAIT, client_task).await;
    net.handle.shutdown().await;
}

#[tokio::test]
async fn udp_roaming_follows_the_authenticated_source() {
    let mut net = start_server(Transport::Udp, 256).await;
    let server_addr = net.handle.local_addr(Transport::Udp).unwrap();

    // a hand-driven client so the test controls which socket speaks
    let first = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (initiator, message) =
        Initiator::start(&net.client_identity, &net.server_public, None).unwrap();
    let mut framed = vec![0u8; ROUTE_ID_LEN + message.len()];
    framed[..ROUTE_ID_LEN].copy_from_slice(&HANDSHAKE_ROUTE_ID.to_be_bytes());
    framed[ROUTE_ID_LEN..].copy_from_slice(&message);
    first.send_to(&framed, server_addr).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = timeout(WAIT, first.recv_from(&mut buf)).await.unwrap().unwrap();
    let ClientOutcome::Established { keys, grant } =
        initiator.read_reply(&buf[ROUTE_ID_LEN..n]).unwrap()
    else {
        panic!("expected an established session");
    };
    let mut crypto = CryptoSession::new(Role::Client, &keys);

    // move to a new socket mid-session and send authenticated data from it
    let second = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = ipv4_packet(Ipv4Addr::new(10, 8, 0, 2), Ipv4Addr::new(10, 8, 0, 1), b"roam");
    let header = Transport::Udp.header_len();
    let mut wire = vec![0u8; header + packet.len() + 16];
    wire[header..header + packet.len()].copy_from_slice(&packet);
    let total = crypto
        .seal_datagram(grant.route_id, &mut wire, packet.len())
        .unwrap();
    second.send_to(&wire[..total], server_addr).await.unwrap();

    // replies now go to the second socket
    let seen = timeout(WAIT, net.server_tun.outbound())
        .await
        .expect("roamed packet crosses")
        .unwrap();
    assert_eq!(seen, packet);

    let down = ipv4_packet(Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(10, 8, 0, 2), b"back");
    net.server_tun.inject(&down);
    let (n, _) = timeout(WAIT, second.recv_from(&mut buf)).await.unwrap().unwrap();
    let payload = crypto.open_datagram(&mut buf[..n]).unwrap();
    assert_eq!(&payload[..], &down[..]);

    net.cancel.cancel();
    net.handle.shutdown().await;
}

#[tokio::test]
async fn disabling_a_peer_revokes_its_live_session() {
    let mut net = start_server(Transport::Tcp, 256).await;
    let (device, mut client_tun) = MemoryTun::pair();
    let client = Client::new(
        client_settings(&net, Transport::Tcp, test_timers()),
        Box::new(device),
    );
    let client_task = tokio::spawn(client.run(net.cancel.child_token()));

    wait_for_peer(&net).await;
    round_trip(&mut net, &mut client_tun).await;
    let peer = net
        .handle
        .repository()
        .find_by_destination_ip("10.8.0.2".parse().unwrap())
        .unwrap();

    // the configuration watcher applies the revision
    net.config.update_peers(vec![AllowedPeer {
        name: "alpha".into(),
        public_key: net.client_identity.public(),
        enabled: false,
        client_id: 1,
        allowed_ips: vec!["10.8.0.2/32".parse().unwrap()],
    }]);

    timeout(WAIT, async {
        while !peer.is_closed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("revocation closes the session");
    assert!(net.handle.repository().is_empty());

    net.cancel.cancel();
    let _ = timeout(WAIT, client_task).await;
    net.handle.shutdown().await;
}

#[tokio::test]
async fn overloaded_servers_demand_cookies_and_still_admit_clients() {
    // threshold zero: every handshake sees high load
    let mut net = start_server(Transport::Udp, 0).await;
    let (device, mut client_tun) = MemoryTun::pair();
    let client = Client::new(
        client_settings(&net, Transport::Udp, test_timers()),
        Box::new(device),
    );
    let client_task = tokio::spawn(client.run(net.cancel.child_token()));

    wait_for_peer(&net).await;
    round_trip(&mut net, &mut client_tun).await;

    net.cancel.cancel();
    let _ = timeout(WAIT, client_task).await;
    net.handle.shutdown().await;
}
