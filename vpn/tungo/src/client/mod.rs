// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client assembly.
//!
//! One TUN device, one server, one transport. A connection runs as a set
//! of cooperating futures (wire ingress, TUN egress with the rekey
//! scheduler, keepalive on TCP) under one `select`; whichever fails first
//! decides the connection's fate. Reconnectable endings re-handshake from
//! scratch against the same device.

use crate::{
    config::Timers,
    control::{Keepalive, RekeyScheduler},
    dataplane::{self, send_service, Egress, STREAM_QUEUE_DEPTH},
    session::{Peer, PeerInfo},
    transport::framing,
    tun::TunDevice,
    ConnectionError, Transport,
};
use futures::{SinkExt, StreamExt};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::{TcpStream, UdpSocket},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tungo_core::{
    inet::AllowedSources,
    packet::{datagram::HANDSHAKE_ROUTE_ID, ROUTE_ID_LEN},
};
use tungo_crypto::{
    endpoint::Role,
    handshake::{
        self, ClientOutcome, Identity, Initiator, SessionGrant, HANDSHAKE_DEADLINE,
        MAX_MESSAGE_LEN,
    },
    rekey::EpochKeys,
    session::CryptoSession,
};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Everything a client endpoint needs to reach its server
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub transport: Transport,
    pub server_addr: SocketAddr,
    pub server_public: [u8; 32],
    pub x25519_private: [u8; 32],
    pub mtu: u16,
    pub timers: Timers,
}

impl ClientSettings {
    fn identity(&self) -> Identity {
        Identity::new(self.x25519_private)
    }

    fn transport_mtu(&self) -> u16 {
        match self.transport {
            Transport::Udp => self.mtu.saturating_sub(
                (Transport::Udp.overhead() - Transport::Tcp.overhead()) as u16,
            ),
            _ => self.mtu,
        }
    }
}

/// The assembled client endpoint
pub struct Client {
    settings: ClientSettings,
    device: Box<dyn TunDevice>,
}

impl Client {
    pub fn new(settings: ClientSettings, device: Box<dyn TunDevice>) -> Self {
        Self { settings, device }
    }

    /// Runs the tunnel until cancelled, re-handshaking after recoverable
    /// endings (server restart, epoch exhaustion, session reset).
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConnectionError> {
        let Self { settings, device } = self;
        let identity = settings.identity();
        let (mut tun_read, tun_write) = tokio::io::split(device);
        let tun_write = Arc::new(Mutex::new(tun_write));

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let result = run_connection(
                &settings,
                &identity,
                &mut tun_read,
                &tun_write,
                &cancel,
            )
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(error) if error.is_reconnectable() && !cancel.is_cancelled() => {
                    tracing::warn!(%error, "session ended, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

async fn run_connection(
    settings: &ClientSettings,
    identity: &Identity,
    tun_read: &mut ReadHalf<Box<dyn TunDevice>>,
    tun_write: &Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    match settings.transport {
        Transport::Tcp => run_tcp(settings, identity, tun_read, tun_write, cancel).await,
        Transport::Udp => run_udp(settings, identity, tun_read, tun_write, cancel).await,
        Transport::Ws => run_ws(settings, identity, tun_read, tun_write, cancel).await,
    }
}

fn build_peer(
    settings: &ClientSettings,
    identity: &Identity,
    keys: &EpochKeys,
    grant: &SessionGrant,
    egress: Egress,
) -> Arc<Peer> {
    let route_id = (settings.transport == Transport::Udp).then_some(grant.route_id);
    Peer::new(
        PeerInfo {
            client_id: 0,
            public_key: identity.public(),
            internal_ipv4: grant.ipv4,
            internal_ipv6: grant.ipv6,
            route_id,
            allowed_sources: AllowedSources::default(),
            transport: settings.transport,
        },
        settings.server_addr,
        CryptoSession::new(Role::Client, keys),
        egress,
    )
}

fn scheduler(settings: &ClientSettings) -> RekeyScheduler {
    RekeyScheduler::new(
        Instant::now(),
        settings.timers.rekey_interval,
        settings.timers.rekey_timeout,
    )
}

async fn run_tcp(
    settings: &ClientSettings,
    identity: &Identity,
    tun_read: &mut ReadHalf<Box<dyn TunDevice>>,
    tun_write: &Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    let stream = TcpStream::connect(settings.server_addr).await?;
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let (keys, grant) = tokio::time::timeout(
        HANDSHAKE_DEADLINE,
        stream_handshake(settings, identity, &mut read_half, &mut write_half),
    )
    .await
    .map_err(|_| ConnectionError::HandshakeTimeout)??;

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(STREAM_QUEUE_DEPTH);
    let peer = build_peer(settings, identity, &keys, &grant, Egress::stream(frame_tx));
    tracing::info!(internal = %grant.ipv4, "tcp tunnel established");

    let mtu = settings.transport_mtu();
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = stream_ingress(&mut read_half, &peer, tun_write, mtu) => result,
        result = dataplane::run_client_tun(
            tun_read, peer.clone(), scheduler(settings), mtu, cancel.clone()) => result,
        result = keepalive_loop(&peer, settings.timers) => result,
        _ = async {
            while let Some(frame) = frame_rx.recv().await {
                if framing::write_message(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        } => Err(ConnectionError::PeerClosed),
    };

    peer.close();
    result
}

/// Noise exchange over the length-prefixed stream, retrying once with a
/// cookie when challenged.
async fn stream_handshake<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    settings: &ClientSettings,
    identity: &Identity,
    read_half: &mut R,
    write_half: &mut W,
) -> Result<(EpochKeys, SessionGrant), ConnectionError> {
    let mut cookie: Option<Vec<u8>> = None;
    let mut buf = [0u8; MAX_MESSAGE_LEN];

    loop {
        let (initiator, message) =
            Initiator::start(identity, &settings.server_public, cookie.as_deref())?;
        framing::write_message(write_half, &message).await?;

        let n = framing::read_message(read_half, &mut buf)
            .await?
            .ok_or(ConnectionError::Handshake(handshake::Error::Malformed))?;

        match initiator.read_reply(&buf[..n])? {
            ClientOutcome::Established { keys, grant } => return Ok((keys, grant)),
            ClientOutcome::CookieChallenge(challenge) => {
                if cookie.is_some() {
                    // challenged twice; the cookie we presented was refused
                    return Err(ConnectionError::Handshake(handshake::Error::CookieRequired));
                }
                cookie = Some(challenge);
            }
        }
    }
}

async fn stream_ingress<R: AsyncRead + Unpin>(
    read_half: &mut R,
    peer: &Arc<Peer>,
    tun_write: &Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>,
    mtu: u16,
) -> Result<(), ConnectionError> {
    let mut buf = vec![0u8; Transport::Tcp.wire_capacity(mtu)];
    loop {
        let n = match framing::read_message(read_half, &mut buf).await? {
            Some(n) => n,
            None => return Err(ConnectionError::ServerUnreachable),
        };

        let bytes = &mut buf[..n];
        let payload = peer
            .with_crypto(|crypto| crypto.open_frame(bytes))
            .map_err(|_| ConnectionError::PeerClosed)?
            .map_err(|error| {
                tracing::debug!(%error, "decrypt failed");
                ConnectionError::Decrypt
            })?;
        peer.touch_recv(Instant::now());

        dataplane::client_handle_payload(peer, payload, tun_write, false).await?;
    }
}

async fn keepalive_loop(peer: &Arc<Peer>, timers: Timers) -> Result<(), ConnectionError> {
    let mut keepalive = Keepalive::new(timers.ping_interval, timers.ping_restart_timeout);
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if let Some(ping) = keepalive.poll(peer.last_recv(), Instant::now())? {
            send_service(peer, &ping).await?;
        }
    }
}

async fn run_udp(
    settings: &ClientSettings,
    identity: &Identity,
    tun_read: &mut ReadHalf<Box<dyn TunDevice>>,
    tun_write: &Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    let bind_addr: SocketAddr = if settings.server_addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal address")
    } else {
        "[::]:0".parse().expect("literal address")
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(settings.server_addr).await?;

    let (keys, grant) = tokio::time::timeout(
        HANDSHAKE_DEADLINE,
        datagram_handshake(settings, identity, &socket),
    )
    .await
    .map_err(|_| ConnectionError::HandshakeTimeout)??;

    let peer = build_peer(
        settings,
        identity,
        &keys,
        &grant,
        Egress::datagram(socket.clone()),
    );
    tracing::info!(internal = %grant.ipv4, route_id = grant.route_id, "udp tunnel established");

    let mtu = settings.transport_mtu();
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = datagram_ingress(&socket, &peer, tun_write, mtu) => result,
        result = dataplane::run_client_tun(
            tun_read, peer.clone(), scheduler(settings), mtu, cancel.clone()) => result,
    };

    peer.close();
    result
}

async fn datagram_handshake(
    settings: &ClientSettings,
    identity: &Identity,
    socket: &UdpSocket,
) -> Result<(EpochKeys, SessionGrant), ConnectionError> {
    let mut cookie: Option<Vec<u8>> = None;
    let mut buf = [0u8; ROUTE_ID_LEN + MAX_MESSAGE_LEN];

    loop {
        let (initiator, message) =
            Initiator::start(identity, &settings.server_public, cookie.as_deref())?;
        let mut framed = vec![0u8; ROUTE_ID_LEN + message.len()];
        framed[..ROUTE_ID_LEN].copy_from_slice(&HANDSHAKE_ROUTE_ID.to_be_bytes());
        framed[ROUTE_ID_LEN..].copy_from_slice(&message);
        socket.send(&framed).await?;

        let n = socket.recv(&mut buf).await?;
        if n < ROUTE_ID_LEN || buf[..ROUTE_ID_LEN] != HANDSHAKE_ROUTE_ID.to_be_bytes() {
            return Err(ConnectionError::Handshake(handshake::Error::Malformed));
        }

        match initiator.read_reply(&buf[ROUTE_ID_LEN..n])? {
            ClientOutcome::Established { keys, grant } => return Ok((keys, grant)),
            ClientOutcome::CookieChallenge(challenge) => {
                if cookie.is_some() {
                    return Err(ConnectionError::Handshake(handshake::Error::CookieRequired));
                }
                cookie = Some(challenge);
            }
        }
    }
}

async fn datagram_ingress(
    socket: &UdpSocket,
    peer: &Arc<Peer>,
    tun_write: &Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>,
    mtu: u16,
) -> Result<(), ConnectionError> {
    let mut buf = vec![0u8; Transport::Udp.wire_capacity(mtu)];
    loop {
        let n = socket.recv(&mut buf).await?;
        let bytes = &mut buf[..n];

        let payload = match peer.with_crypto(|crypto| crypto.open_datagram(bytes)) {
            Ok(Ok(payload)) => payload,
            // datagram decrypt failures drop the packet, not the session
            Ok(Err(error)) => {
                tracing::trace!(%error, "udp decrypt failed, dropping datagram");
                continue;
            }
            Err(_) => return Err(ConnectionError::PeerClosed),
        };
        peer.touch_recv(Instant::now());

        // the datagram path is the one place the legacy reset survives
        dataplane::client_handle_payload(peer, payload, tun_write, true).await?;
    }
}

async fn run_ws(
    settings: &ClientSettings,
    identity: &Identity,
    tun_read: &mut ReadHalf<Box<dyn TunDevice>>,
    tun_write: &Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    let url = format!("ws://{}/", settings.server_addr);
    let (websocket, _) = connect_async(&url).await?;
    let (mut sink, mut stream) = websocket.split();

    let (keys, grant) = tokio::time::timeout(HANDSHAKE_DEADLINE, async {
        let mut cookie: Option<Vec<u8>> = None;
        loop {
            let (initiator, message) =
                Initiator::start(identity, &settings.server_public, cookie.as_deref())?;
            sink.send(Message::Binary(message)).await?;

            let reply = loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(bytes))) => break bytes,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => return Err(error.into()),
                    None => {
                        return Err(ConnectionError::Handshake(handshake::Error::Malformed))
                    }
                }
            };

            match initiator.read_reply(&reply)? {
                ClientOutcome::Established { keys, grant } => return Ok((keys, grant)),
                ClientOutcome::CookieChallenge(challenge) => {
                    if cookie.is_some() {
                        return Err(ConnectionError::Handshake(
                            handshake::Error::CookieRequired,
                        ));
                    }
                    cookie = Some(challenge);
                }
            }
        }
    })
    .await
    .map_err(|_| ConnectionError::HandshakeTimeout)??;

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(STREAM_QUEUE_DEPTH);
    let peer = build_peer(settings, identity, &keys, &grant, Egress::stream(frame_tx));
    tracing::info!(internal = %grant.ipv4, "ws tunnel established");

    let mtu = settings.transport_mtu();
    let capacity = Transport::Ws.wire_capacity(mtu);
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = async {
            loop {
                let Some(message) = stream.next().await else {
                    return Err(ConnectionError::ServerUnreachable);
                };
                let mut bytes = match message? {
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => return Err(ConnectionError::ServerUnreachable),
                    _ => continue,
                };
                if bytes.len() > capacity {
                    return Err(ConnectionError::FrameOutOfBounds);
                }

                let frame = bytes.as_mut_slice();
                let payload = peer
                    .with_crypto(move |crypto| crypto.open_frame(frame))
                    .map_err(|_| ConnectionError::PeerClosed)?
                    .map_err(|_| ConnectionError::Decrypt)?;
                peer.touch_recv(Instant::now());

                dataplane::client_handle_payload(&peer, payload, tun_write, false).await?;
            }
        } => result,
        result = dataplane::run_client_tun(
            tun_read, peer.clone(), scheduler(settings), mtu, cancel.clone()) => result,
        _ = async {
            while let Some(frame) = frame_rx.recv().await {
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        } => Err(ConnectionError::PeerClosed),
    };

    peer.close();
    result
}
