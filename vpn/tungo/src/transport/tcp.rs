// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP ingress: accept, handshake, then one ingress worker and one writer
//! task per connection.

use crate::{
    dataplane::{self, Egress, STREAM_QUEUE_DEPTH},
    session::{Peer, Registrar, Registration, SessionRepository},
    transport::framing,
    tun::TunDevice,
    ConnectionError, Transport,
};
use std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant};
use tokio::{
    io::{AsyncWriteExt, WriteHalf},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tungo_crypto::handshake::{self, HANDSHAKE_DEADLINE, MAX_MESSAGE_LEN};

type SharedTunWriter = Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>;

/// Runs the TCP flavor: the accept loop plus the TUN fan-out for this
/// listener's device. Returns after cancellation.
pub async fn serve_tcp(
    listener: TcpListener,
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
        Transport::Tcp,
        mtu,
        cancel.clone(),
    ));

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    registrar.clone(),
                    repository.clone(),
                    tun_write.clone(),
                    mtu,
                    cancel.clone(),
                ));
            }
            Err(error) => {
                tracing::warn!(%error, "tcp accept failed, backing off");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    let _ = tun_task.await;
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registrar: Arc<Registrar>,
    repository: Arc<SessionRepository>,
    tun_write: SharedTunWriter,
    mtu: u16,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (frame_tx, frame_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);

    let peer = match tokio::time::timeout(
        HANDSHAKE_DEADLINE,
        accept_handshake(&mut read_half, &mut write_half, addr, &registrar, &frame_tx),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err(error)) => {
            tracing::debug!(%addr, %error, "tcp handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(%addr, "tcp handshake deadline exceeded");
            return;
        }
    };

    let writer = tokio::spawn(run_writer(write_half, frame_rx));

    let result = ingress_loop(&mut read_half, &peer, &tun_write, mtu, &cancel).await;
    match &result {
        Ok(()) => tracing::debug!(%addr, "tcp connection closed"),
        Err(error) => tracing::debug!(%addr, %error, "tcp connection torn down"),
    }

    repository.delete(&peer);
    drop(frame_tx);
    let _ = writer.await;
}

/// Reads handshake messages until the session is established; cookie
/// challenges loop on the same connection.
async fn accept_handshake(
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    addr: SocketAddr,
    registrar: &Registrar,
    frame_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<Arc<Peer>, ConnectionError> {
    let mut buf = [0u8; MAX_MESSAGE_LEN];
    loop {
        let n = framing::read_message(read_half, &mut buf)
            .await?
            .ok_or(ConnectionError::Handshake(handshake::Error::Malformed))?;

        match registrar.register(
            Transport::Tcp,
            addr,
            Egress::stream(frame_tx.clone()),
            &buf[..n],
        )? {
            Registration::CookieRequired(challenge) => {
                framing::write_message(write_half, &challenge).await?;
            }
            Registration::Established { reply, peer } => {
                framing::write_message(write_half, &reply).await?;
                return Ok(peer);
            }
        }
    }
}

/// Drains sealed envelopes from the egress channel onto the socket
pub(crate) async fn run_writer<W: tokio::io::AsyncWrite + Unpin>(
    mut write_half: W,
    mut frame_rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if framing::write_message(&mut write_half, &frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Per-connection wire-to-TUN loop
async fn ingress_loop(
    read_half: &mut OwnedReadHalf,
    peer: &Arc<Peer>,
    tun_write: &SharedTunWriter,
    mtu: u16,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    let mut buf = vec![0u8; Transport::Tcp.wire_capacity(mtu)];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = framing::read_message(read_half, &mut buf) => read,
        };
        let n = match read? {
            Some(n) => n,
            None => return Ok(()),
        };

        let bytes = &mut buf[..n];
        // a stream peer that fails authentication is torn down; the
        // transport is reliable, so this is never reordering
        let payload = peer
            .with_crypto(|crypto| crypto.open_frame(bytes))
            .map_err(|_| ConnectionError::PeerClosed)?
            .map_err(|error| {
                tracing::debug!(%error, "tcp decrypt failed");
                ConnectionError::Decrypt
            })?;
        peer.touch_recv(Instant::now());

        dataplane::server_handle_payload(peer, payload, tun_write).await?;
    }
}
