// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The TUN device contract.
//!
//! The core never creates devices, assigns addresses or touches firewall
//! rules; it consumes a bidirectional packet stream. One read yields one IP
//! packet (truncated to the buffer if oversized, as the platform device
//! does) and one write submits one packet. Platform integration lives
//! behind [`TunFactory`].

use crate::{config::Settings, Transport};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A TUN device as the data plane sees it
pub trait TunDevice: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> TunDevice for T {}

/// Creates and tears down the platform devices backing each transport
pub trait TunFactory: Send + Sync + 'static {
    /// A configured device for `transport`
    fn create_device(
        &self,
        transport: Transport,
        settings: &Settings,
    ) -> io::Result<Box<dyn TunDevice>>;

    /// Removes every device and firewall rule created from `settings`
    fn dispose_devices(&self, settings: &Settings) -> io::Result<()>;

    /// Reverts addressing and NAT for `settings` without removing devices.
    ///
    /// Takes the settings so NAT teardown knows the source subnet.
    fn unconfigure(&self, settings: &Settings) -> io::Result<()>;
}

/// In-memory devices for tests and simulations
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::{
        collections::HashMap,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::{
        io::ReadBuf,
        sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    };

    /// One end of an in-memory packet pipe.
    ///
    /// Unlike a byte duplex, packet boundaries survive: every write is one
    /// packet and every read returns at most one.
    pub struct MemoryTun {
        rx: UnboundedReceiver<Vec<u8>>,
        tx: UnboundedSender<Vec<u8>>,
    }

    impl MemoryTun {
        /// A cross-connected pair of devices
        pub fn pair() -> (MemoryTun, MemoryTun) {
            let (a_tx, a_rx) = unbounded_channel();
            let (b_tx, b_rx) = unbounded_channel();
            (
                MemoryTun { rx: a_rx, tx: b_tx },
                MemoryTun { rx: b_rx, tx: a_tx },
            )
        }

        /// Submits one packet into the device, as the kernel side would
        pub fn inject(&self, packet: &[u8]) {
            let _ = self.tx.send(packet.to_vec());
        }

        /// Waits for the next packet the data plane wrote
        pub async fn outbound(&mut self) -> Option<Vec<u8>> {
            self.rx.recv().await
        }
    }

    impl AsyncRead for MemoryTun {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(packet)) => {
                    let len = packet.len().min(buf.remaining());
                    buf.put_slice(&packet[..len]);
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(None) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            }
        }
    }

    impl AsyncWrite for MemoryTun {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| io::ErrorKind::BrokenPipe.into())
                .map(|_| buf.len())
                .into()
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Factory handing out [`MemoryTun`] devices and keeping the far ends
    /// for the test to drive.
    #[derive(Default)]
    pub struct MemoryTunFactory {
        kernel_ends: Mutex<HashMap<Transport, MemoryTun>>,
    }

    impl MemoryTunFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// The kernel side of the device created for `transport`
        pub fn kernel_end(&self, transport: Transport) -> Option<MemoryTun> {
            self.kernel_ends.lock().remove(&transport)
        }
    }

    impl TunFactory for MemoryTunFactory {
        fn create_device(
            &self,
            transport: Transport,
            _settings: &Settings,
        ) -> io::Result<Box<dyn TunDevice>> {
            let (device, kernel) = MemoryTun::pair();
            self.kernel_ends.lock().insert(transport, kernel);
            Ok(Box::new(device))
        }

        fn dispose_devices(&self, _settings: &Settings) -> io::Result<()> {
            self.kernel_ends.lock().clear();
            Ok(())
        }

        fn unconfigure(&self, _settings: &Settings) -> io::Result<()> {
            Ok(())
        }
    }

}
