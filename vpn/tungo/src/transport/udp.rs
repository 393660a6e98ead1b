// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! UDP ingress: one task serves every peer on the socket.
//!
//! Datagrams carrying route-id 0 are handshake envelopes; everything else
//! dispatches O(1) by route-id to the owning peer before any crypto runs.
//! The first authenticated datagram from a new source address moves the
//! peer's external endpoint (roaming).

use crate::{
    dataplane::{self, Egress},
    session::{Registrar, Registration, SessionRepository},
    tun::TunDevice,
    ConnectionError, Transport,
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::{io::WriteHalf, net::UdpSocket, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tungo_core::packet::{datagram::Datagram, datagram::HANDSHAKE_ROUTE_ID, ROUTE_ID_LEN};

type SharedTunWriter = Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>;

/// Runs the UDP flavor until cancellation.
pub async fn serve_udp(
    socket: Arc<UdpSocket>,
    registrar: Arc<Registrar>,
    repository: Arc<SessionRepository>,
    tun: Box<dyn TunDevice>,
    mtu: u16,
    cancel: CancellationToken,
) {
    let (tun_read, tun_write) = tokio::io::split(tun);
    let tun_write: SharedTunWriter = Arc::new(Mutex::new(tun_write));

    let tun_task = tokio::spawn(dataplane::run_server_tun(
        tun_read,
        repository.clone(),
        Transport::Udp,
        mtu,
        cancel.clone(),
    ));

    let mut buf = vec![0u8; Transport::Udp.wire_capacity(mtu)];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, addr) = match received {
            Ok(received) => received,
            Err(error) => {
                tracing::warn!(%error, "udp recv failed, continuing");
                continue;
            }
        };

        match Datagram::peek_route_id(&buf[..n]) {
            None => continue, // runt datagram
            Some(HANDSHAKE_ROUTE_ID) => {
                handle_handshake(&socket, &registrar, addr, &buf[ROUTE_ID_LEN..n]).await;
            }
            Some(route_id) => {
                handle_datagram(
                    &repository,
                    route_id,
                    addr,
                    &mut buf[..n],
                    &tun_write,
                )
                .await;
            }
        }
    }

    let _ = tun_task.await;
}

/// One handshake message, one reply; no per-client state is kept before
/// authentication completes.
async fn handle_handshake(
    socket: &Arc<UdpSocket>,
    registrar: &Registrar,
    addr: SocketAddr,
    message: &[u8],
) {
    let registration =
        registrar.register(Transport::Udp, addr, Egress::datagram(socket.clone()), message);
    let reply = match registration {
        Ok(Registration::CookieRequired(challenge)) => challenge,
        Ok(Registration::Established { reply, .. }) => reply,
        Err(error) => {
            tracing::debug!(%addr, %error, "udp handshake failed");
            return;
        }
    };

    let mut framed = vec![0u8; ROUTE_ID_LEN + reply.len()];
    framed[..ROUTE_ID_LEN].copy_from_slice(&HANDSHAKE_ROUTE_ID.to_be_bytes());
    framed[ROUTE_ID_LEN..].copy_from_slice(&reply);
    if let Err(error) = socket.send_to(&framed, addr).await {
        tracing::debug!(%addr, %error, "udp handshake reply failed");
    }
}

async fn handle_datagram(
    repository: &Arc<SessionRepository>,
    route_id: u64,
    addr: SocketAddr,
    bytes: &mut [u8],
    tun_write: &SharedTunWriter,
) {
    let Some(peer) = repository.get_by_route_id(route_id) else {
        tracing::trace!(route_id, "datagram for unknown route");
        return;
    };

    let payload = match peer.with_crypto(|crypto| crypto.open_datagram(bytes)) {
        Ok(Ok(payload)) => payload,
        // per-packet on datagrams: drop and keep the session
        Ok(Err(error)) => {
            tracing::trace!(%error, "udp decrypt failed, dropping datagram");
            return;
        }
        Err(_) => return,
    };
    peer.touch_recv(Instant::now());

    // roaming: the index follows the first authenticated datagram from a
    // new source
    if addr != peer.external() {
        repository.update_external_addr(&peer, addr);
    }

    if let Err(error) = dataplane::server_handle_payload(&peer, payload, tun_write).await {
        match error {
            // teardown errors remove this peer; the socket serves the rest
            ConnectionError::SessionReset | ConnectionError::Io(_) => {
                tracing::debug!(client_id = peer.info().client_id, %error, "removing udp peer");
                repository.delete(&peer);
            }
            _ => {
                tracing::trace!(%error, "udp payload handling failed");
            }
        }
    }
}
