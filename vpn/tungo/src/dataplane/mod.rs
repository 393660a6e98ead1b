// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The packet-moving half of the endpoint.
//!
//! Transports read ciphertext and hand it here; this module owns what
//! happens between decrypt and the TUN device in one direction, and between
//! the TUN device and seal in the other. Per-packet failures are dropped
//! and counted; anything that should end a connection surfaces as
//! [`ConnectionError`](crate::ConnectionError).

use crate::{session::Peer, ConnectionError, Transport};
use tungo_core::packet::{service::ServicePacket, TAG_LEN};

mod egress;
mod tun_handler;
mod worker;

pub use egress::{Egress, EgressError, STREAM_QUEUE_DEPTH};
pub use tun_handler::{run_client_tun, run_server_tun};
pub use worker::{client_handle_payload, server_handle_payload};

/// Seals `packet` for `peer` and sends it through the peer's egress.
///
/// Service packets are small and rare; the buffer is allocated per call.
pub(crate) async fn send_service(
    peer: &Peer,
    packet: &ServicePacket,
) -> Result<(), ConnectionError> {
    let prefix = peer.info().transport.header_len();
    let payload_len = packet.encoding_len();
    let mut buf = vec![0u8; prefix + payload_len + TAG_LEN];
    packet
        .encode(&mut buf[prefix..])
        .expect("buffer is sized for the packet");

    let total = peer
        .with_crypto(|crypto| match peer.info().route_id {
            Some(route_id) if peer.info().transport == Transport::Udp => {
                crypto.seal_datagram(route_id, &mut buf, payload_len)
            }
            _ => crypto.seal_frame(&mut buf, payload_len),
        })
        .map_err(|_| ConnectionError::PeerClosed)?
        .map_err(|_| ConnectionError::PeerClosed)?;
    buf.truncate(total);

    peer.egress()
        .send(buf, peer.external())
        .await
        .map_err(|_| ConnectionError::PeerClosed)
}
