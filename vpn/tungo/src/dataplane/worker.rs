// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Classification of decrypted payloads.
//!
//! Every payload is offered to the service-packet parser first; what is not
//! a service packet is an IP datagram that must pass the source filter
//! before it reaches the TUN device.

use crate::{
    control::{self, ControlAction},
    dataplane::send_service,
    session::Peer,
    ConnectionError,
};
use std::{sync::Arc, time::Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tungo_core::{inet, packet::service::ServicePacket};

/// Handles one decrypted payload on the server side.
///
/// `tun` is shared with every worker on the same listener; writes are one
/// packet each and serialized by the mutex.
pub async fn server_handle_payload<W: AsyncWrite + Unpin>(
    peer: &Arc<Peer>,
    payload: &mut [u8],
    tun: &Arc<tokio::sync::Mutex<W>>,
) -> Result<(), ConnectionError> {
    if let Some(packet) = ServicePacket::try_parse(payload) {
        let now = Instant::now();
        let action = peer
            .with_crypto(|crypto| control::server_handle(crypto, packet, now))
            .map_err(|_| ConnectionError::PeerClosed)??;
        match action {
            ControlAction::None => {}
            ControlAction::Reply(reply) => send_service(peer, &reply).await?,
            ControlAction::ReplyThenActivate(reply, epoch) => {
                // the ack travels under the old epoch, then the new one
                // becomes the send side
                send_service(peer, &reply).await?;
                peer.with_crypto(|crypto| {
                    crypto.fsm_mut().activate_send_epoch(epoch, now);
                })
                .map_err(|_| ConnectionError::PeerClosed)?;
            }
        }
        return Ok(());
    }

    let source = match inet::source(payload) {
        Ok(source) => source,
        Err(error) => {
            tracing::trace!(%error, "dropping packet with malformed IP header");
            return Ok(());
        }
    };
    if !peer.info().allowed_sources.is_allowed(source) {
        tracing::warn!(
            client_id = peer.info().client_id,
            %source,
            "AllowedIPs violation"
        );
        return Ok(());
    }

    tun.lock().await.write_all(payload).await?;
    Ok(())
}

/// Handles one decrypted payload on the client side.
///
/// `allow_legacy` admits the single-byte SessionReset that only the
/// datagram ingest still accepts.
pub async fn client_handle_payload<W: AsyncWrite + Unpin>(
    peer: &Arc<Peer>,
    payload: &mut [u8],
    tun: &Arc<tokio::sync::Mutex<W>>,
    allow_legacy: bool,
) -> Result<(), ConnectionError> {
    let parsed = if allow_legacy {
        ServicePacket::try_parse_legacy(payload)
    } else {
        ServicePacket::try_parse(payload)
    };

    if let Some(packet) = parsed {
        let now = Instant::now();
        let action = peer
            .with_crypto(|crypto| control::client_handle(crypto, packet, now))
            .map_err(|_| ConnectionError::PeerClosed)??;
        match action {
            ControlAction::None => {}
            ControlAction::Reply(reply) => send_service(peer, &reply).await?,
            ControlAction::ReplyThenActivate(reply, epoch) => {
                send_service(peer, &reply).await?;
                peer.with_crypto(|crypto| {
                    crypto.fsm_mut().activate_send_epoch(epoch, Instant::now());
                })
                .map_err(|_| ConnectionError::PeerClosed)?;
            }
        }
        return Ok(());
    }

    // the server is the authenticated route for everything inside the
    // tunnel; no source filtering on the way down
    tun.lock().await.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataplane::Egress,
        session::PeerInfo,
        Transport,
    };
    use core::net::Ipv4Addr;
    use tokio::sync::{mpsc, Mutex};
    use tungo_core::{
        inet::AllowedSources,
        packet::{frame::Frame, TAG_LEN},
    };
    use tungo_crypto::{endpoint::Role, rekey::EpochKeys, session::CryptoSession};

    fn test_peer(allowed: AllowedSources) -> (Arc<Peer>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let peer = Peer::new(
            PeerInfo {
                client_id: 1,
                public_key: [1; 32],
                internal_ipv4: Ipv4Addr::new(10, 8, 0, 2),
                internal_ipv6: None,
                route_id: None,
                allowed_sources: allowed,
                transport: Transport::Tcp,
            },
            "203.0.113.1:9".parse().unwrap(),
            CryptoSession::new(Role::Server, &EpochKeys::new([1; 32], [2; 32])),
            Egress::stream(tx),
        );
        (peer, rx)
    }

    fn ipv4_packet(source: [u8; 4], destination: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&28u16.to_be_bytes());
        packet[12..16].copy_from_slice(&source);
        packet[16..20].copy_from_slice(&destination);
        packet
    }

    #[tokio::test]
    async fn allowed_data_reaches_the_tun() {
        let allowed: AllowedSources = ["10.8.0.2/32".parse().unwrap()].into_iter().collect();
        let (peer, _rx) = test_peer(allowed);
        let tun = Arc::new(Mutex::new(Vec::<u8>::new()));

        let mut packet = ipv4_packet([10, 8, 0, 2], [10, 8, 0, 1]);
        server_handle_payload(&peer, &mut packet, &tun).await.unwrap();
        assert_eq!(tun.lock().await.len(), 28);
    }

    #[tokio::test]
    async fn unauthorized_sources_are_dropped() {
        let allowed: AllowedSources = ["10.8.0.2/32".parse().unwrap()].into_iter().collect();
        let (peer, _rx) = test_peer(allowed);
        let tun = Arc::new(Mutex::new(Vec::<u8>::new()));

        let mut packet = ipv4_packet([10, 8, 0, 99], [10, 8, 0, 1]);
        server_handle_payload(&peer, &mut packet, &tun).await.unwrap();
        assert!(tun.lock().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_headers_are_dropped_not_fatal() {
        let (peer, _rx) = test_peer(AllowedSources::default());
        let tun = Arc::new(Mutex::new(Vec::<u8>::new()));

        let mut packet = vec![0x45, 0x00, 0x00];
        server_handle_payload(&peer, &mut packet, &tun).await.unwrap();
        assert!(tun.lock().await.is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered_through_the_egress() {
        let (peer, mut rx) = test_peer(AllowedSources::default());
        let tun = Arc::new(Mutex::new(Vec::<u8>::new()));

        let mut ping = [0u8; 3];
        ServicePacket::Ping.encode(&mut ping).unwrap();
        server_handle_payload(&peer, &mut ping, &tun).await.unwrap();

        // a sealed pong envelope left through the egress
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.len(), Frame::HEADER_LEN + 3 + TAG_LEN);
        assert!(tun.lock().await.is_empty());
    }

    #[tokio::test]
    async fn reset_from_the_peer_is_a_connection_error() {
        let (peer, _rx) = test_peer(AllowedSources::default());
        let tun = Arc::new(Mutex::new(Vec::<u8>::new()));

        let mut reset = [0u8; 3];
        ServicePacket::SessionReset.encode(&mut reset).unwrap();
        assert!(matches!(
            server_handle_payload(&peer, &mut reset, &tun).await,
            Err(ConnectionError::SessionReset)
        ));
    }
}
