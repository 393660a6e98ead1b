// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! WebSocket ingress: the TCP flow with binary messages as the outer
//! framing.

use crate::{
    dataplane::{self, Egress, STREAM_QUEUE_DEPTH},
    session::{Peer, Registrar, Registration, SessionRepository},
    tun::TunDevice,
    ConnectionError, Transport,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant};
use tokio::{
    io::WriteHalf,
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tungo_crypto::handshake::HANDSHAKE_DEADLINE;

type SharedTunWriter = Arc<Mutex<WriteHalf<Box<dyn TunDevice>>>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Runs the WebSocket flavor until cancellation.
pub async fn serve_ws(
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
        Transport::Ws,
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
                tracing::warn!(%error, "ws accept failed, backing off");
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
    let websocket = match accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(error) => {
            tracing::debug!(%addr, %error, "ws upgrade failed");
            return;
        }
    };
    let (mut sink, mut stream) = websocket.split();
    let (frame_tx, frame_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);

    let peer = match tokio::time::timeout(
        HANDSHAKE_DEADLINE,
        accept_handshake(&mut sink, &mut stream, addr, &registrar, &frame_tx),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err(error)) => {
            tracing::debug!(%addr, %error, "ws handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(%addr, "ws handshake deadline exceeded");
            return;
        }
    };

    let writer = tokio::spawn(run_writer(sink, frame_rx));

    let result = ingress_loop(&mut stream, &peer, &tun_write, mtu, &cancel).await;
    match &result {
        Ok(()) => tracing::debug!(%addr, "ws connection closed"),
        Err(error) => tracing::debug!(%addr, %error, "ws connection torn down"),
    }

    repository.delete(&peer);
    drop(frame_tx);
    let _ = writer.await;
}

async fn accept_handshake(
    sink: &mut WsSink,
    stream: &mut WsStream,
    addr: SocketAddr,
    registrar: &Registrar,
    frame_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<Arc<Peer>, ConnectionError> {
    loop {
        let Some(message) = stream.next().await else {
            return Err(ConnectionError::Handshake(
                tungo_crypto::handshake::Error::Malformed,
            ));
        };
        let Message::Binary(bytes) = message? else {
            continue;
        };

        match registrar.register(
            Transport::Ws,
            addr,
            Egress::stream(frame_tx.clone()),
            &bytes,
        )? {
            Registration::CookieRequired(challenge) => {
                sink.send(Message::Binary(challenge)).await?;
            }
            Registration::Established { reply, peer } => {
                sink.send(Message::Binary(reply)).await?;
                return Ok(peer);
            }
        }
    }
}

/// Drains sealed envelopes from the egress channel into binary messages
pub(crate) async fn run_writer(mut sink: WsSink, mut frame_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frame_rx.recv().await {
        if sink.send(Message::Binary(frame)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn ingress_loop(
    stream: &mut WsStream,
    peer: &Arc<Peer>,
    tun_write: &SharedTunWriter,
    mtu: u16,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    let capacity = Transport::Ws.wire_capacity(mtu);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => next,
        };
        let Some(message) = next else {
            return Ok(());
        };
        let mut bytes = match message? {
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return Ok(()),
            // pings and pongs are the websocket layer's business
            _ => continue,
        };

        // nothing bounds a binary message but us
        if bytes.len() > capacity {
            return Err(ConnectionError::FrameOutOfBounds);
        }

        let frame = bytes.as_mut_slice();
        let payload = peer
            .with_crypto(move |crypto| crypto.open_frame(frame))
            .map_err(|_| ConnectionError::PeerClosed)?
            .map_err(|error| {
                tracing::debug!(%error, "ws decrypt failed");
                ConnectionError::Decrypt
            })?;
        peer.touch_recv(Instant::now());

        dataplane::server_handle_payload(peer, payload, tun_write).await?;
    }
}
