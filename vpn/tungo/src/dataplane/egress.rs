// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound frame senders.
//!
//! Stream transports hand sealed envelopes to a writer task through a
//! bounded channel; a peer that cannot drain its channel loses frames, not
//! the whole TUN handler. Datagram transports send directly on the shared
//! socket. Closing an egress is idempotent and permanent.

use parking_lot::RwLock;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{net::UdpSocket, sync::mpsc};

/// Sealed frames queued to a stream writer task beyond this are dropped
pub const STREAM_QUEUE_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("egress is closed")]
    Closed,
    #[error("datagram send failed: {0}")]
    Io(#[from] std::io::Error),
}

enum Inner {
    Stream {
        tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    },
    Datagram {
        socket: Arc<UdpSocket>,
        closed: AtomicBool,
    },
}

/// A peer's outbound half
pub struct Egress {
    inner: Inner,
}

impl Egress {
    /// Egress through a writer task owning the stream's write half
    pub fn stream(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            inner: Inner::Stream {
                tx: RwLock::new(Some(tx)),
            },
        }
    }

    /// Egress straight onto the shared datagram socket
    pub fn datagram(socket: Arc<UdpSocket>) -> Self {
        Self {
            inner: Inner::Datagram {
                socket,
                closed: AtomicBool::new(false),
            },
        }
    }

    /// Sends one sealed envelope toward `dest`.
    ///
    /// Stream egress ignores `dest`; the connection already fixes it. A full
    /// stream queue drops the frame silently, matching what the network
    /// would do to a peer that cannot keep up.
    pub async fn send(&self, frame: Vec<u8>, dest: SocketAddr) -> Result<(), EgressError> {
        match &self.inner {
            Inner::Stream { tx } => {
                let sender = tx.read().clone().ok_or(EgressError::Closed)?;
                match sender.try_send(frame) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!("stream egress queue full, dropping frame");
                        Ok(())
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(EgressError::Closed),
                }
            }
            Inner::Datagram { socket, closed } => {
                if closed.load(Ordering::Acquire) {
                    return Err(EgressError::Closed);
                }
                socket.send_to(&frame, dest).await?;
                Ok(())
            }
        }
    }

    /// Closes the egress. The stream writer task ends once the channel
    /// drains.
    pub fn close(&self) {
        match &self.inner {
            Inner::Stream { tx } => {
                *tx.write() = None;
            }
            Inner::Datagram { closed, .. } => {
                closed.store(true, Ordering::Release);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            Inner::Stream { tx } => tx.read().is_none(),
            Inner::Datagram { closed, .. } => closed.load(Ordering::Acquire),
        }
    }
}

impl core::fmt::Debug for Egress {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let kind = match &self.inner {
            Inner::Stream { .. } => "Stream",
            Inner::Datagram { .. } => "Datagram",
        };
        f.debug_struct("Egress")
            .field("kind", &kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn stream_egress_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        let egress = Egress::stream(tx);
        egress.send(vec![1], dest()).await.unwrap();
        egress.send(vec![2], dest()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1]);
        assert_eq!(rx.recv().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn a_full_queue_drops_rather_than_blocks() {
        let (tx, _rx) = mpsc::channel(1);
        let egress = Egress::stream(tx);
        egress.send(vec![1], dest()).await.unwrap();
        // queue is full; this neither blocks nor errors
        egress.send(vec![2], dest()).await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_egress_reports_closed() {
        let (tx, _rx) = mpsc::channel(1);
        let egress = Egress::stream(tx);
        assert!(!egress.is_closed());
        egress.close();
        egress.close();
        assert!(egress.is_closed());
        assert!(matches!(
            egress.send(vec![1], dest()).await,
            Err(EgressError::Closed)
        ));
    }

    #[tokio::test]
    async fn datagram_egress_sends_to_the_given_destination() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let egress = Egress::datagram(socket);

        egress
            .send(vec![9, 9], receiver.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[9, 9]);

        egress.close();
        assert!(matches!(
            egress.send(vec![1], receiver.local_addr().unwrap()).await,
            Err(EgressError::Closed)
        ));
    }
}
