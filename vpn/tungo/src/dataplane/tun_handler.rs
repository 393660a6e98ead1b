// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The TUN-to-wire direction.
//!
//! One handler per listener reads the device into a buffer that reserves
//! the transport's envelope prefix, parses the destination, seals in place
//! and hands the envelope to the owning peer's egress. The client variant
//! drives the rekey scheduler inline with its read loop.

use crate::{
    control::RekeyScheduler,
    dataplane::send_service,
    session::{Peer, SessionRepository},
    ConnectionError, Transport,
};
use std::{sync::Arc, time::Duration, time::Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tungo_core::{inet, packet::TAG_LEN};

/// How long a quiet client TUN read may park before the scheduler gets a
/// look at its deadlines anyway.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Reads the server's TUN device and fans packets out to peers by
/// destination address.
pub async fn run_server_tun<R: AsyncRead + Unpin>(
    mut tun: R,
    repository: Arc<SessionRepository>,
    transport: Transport,
    mtu: u16,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let prefix = transport.header_len();
    let mtu = mtu as usize;
    let mut buf = vec![0u8; prefix + mtu + TAG_LEN];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tun.read(&mut buf[prefix..prefix + mtu]) => read,
        };
        let n = match read {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(error) => {
                // device hiccups are a subsystem problem, not a teardown
                tracing::warn!(%error, "tun read failed, retrying");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Ok(destination) = inet::destination(&buf[prefix..prefix + n]) else {
            continue;
        };
        let Some(peer) = repository.find_by_destination_ip(destination) else {
            tracing::trace!(%destination, "no peer routes this destination");
            continue;
        };

        match seal_for(&peer, &mut buf, n) {
            Some(total) => {
                if peer.egress().send(buf[..total].to_vec(), peer.external()).await.is_err() {
                    tracing::debug!(client_id = peer.info().client_id, "egress failed, removing peer");
                    repository.delete(&peer);
                }
            }
            None => continue,
        }
    }
}

/// Reads the client's TUN device toward the one server peer, running the
/// rekey scheduler on every iteration.
pub async fn run_client_tun<R: AsyncRead + Unpin>(
    mut tun: R,
    peer: Arc<Peer>,
    mut scheduler: RekeyScheduler,
    mtu: u16,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let prefix = peer.info().transport.header_len();
    let mtu = mtu as usize;
    let mut buf = vec![0u8; prefix + mtu + TAG_LEN];

    loop {
        // deadline work rides the read loop; a quiet tunnel still rotates
        if let Some(init) = peer
            .with_crypto(|crypto| scheduler.poll(crypto, Instant::now()))
            .map_err(|_| ConnectionError::PeerClosed)?
        {
            send_service(&peer, &init).await?;
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(SCHEDULER_TICK, tun.read(&mut buf[prefix..prefix + mtu])) => read,
        };
        let n = match read {
            Err(_) => continue, // timeout: scheduler tick only
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(error)) => return Err(error.into()),
        };

        match seal_for(&peer, &mut buf, n) {
            Some(total) => {
                peer.egress()
                    .send(buf[..total].to_vec(), peer.external())
                    .await
                    .map_err(|_| ConnectionError::PeerClosed)?;
            }
            None => continue,
        }
    }
}

/// Seals one plaintext packet in `buf` for `peer`; `None` drops it
fn seal_for(peer: &Peer, buf: &mut [u8], payload_len: usize) -> Option<usize> {
    let sealed = peer.with_crypto(|crypto| match peer.info().route_id {
        Some(route_id) if peer.info().transport == Transport::Udp => {
            crypto.seal_datagram(route_id, buf, payload_len)
        }
        _ => crypto.seal_frame(buf, payload_len),
    });
    match sealed {
        Ok(Ok(total)) => Some(total),
        Ok(Err(error)) => {
            // nonce exhaustion surfaces here; the scheduler will rotate
            tracing::warn!(%error, "seal failed, dropping packet");
            None
        }
        Err(_) => None,
    }
}
