// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport bindings: accept loops and the outer framing each protocol
//! supplies around the common envelope.
//!
//! TCP frames envelopes with a 2-byte big-endian length prefix. WebSocket
//! carries one envelope per binary message. UDP carries one envelope per
//! datagram and dispatches by the route-id in front of it.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tungo_core::packet::{datagram::Datagram, frame::Frame, TAG_LEN};

mod tcp;
mod udp;
mod ws;

pub use tcp::serve_tcp;
pub use udp::serve_udp;
pub use ws::serve_ws;

/// The three wire flavors a session can ride on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Ws,
}

impl Transport {
    /// Envelope bytes preceding the ciphertext
    #[inline]
    pub const fn header_len(self) -> usize {
        match self {
            Self::Tcp | Self::Ws => Frame::HEADER_LEN,
            Self::Udp => Datagram::HEADER_LEN,
        }
    }

    /// Total envelope expansion over the plaintext
    #[inline]
    pub const fn overhead(self) -> usize {
        self.header_len() + TAG_LEN
    }

    /// Largest wire message this transport produces for `mtu`
    #[inline]
    pub const fn wire_capacity(self, mtu: u16) -> usize {
        self.header_len() + mtu as usize + TAG_LEN
    }
}

impl core::fmt::Display for Transport {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let name = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Ws => "ws",
        };
        f.write_str(name)
    }
}

/// Length-prefixed message framing for the TCP byte stream
pub(crate) mod framing {
    use super::*;

    /// Reads one length-prefixed message into the front of `buf`.
    ///
    /// `Ok(None)` is a clean end of stream at a message boundary. Lengths
    /// that are zero or exceed `buf` are protocol violations.
    pub async fn read_message<S: AsyncRead + Unpin>(
        stream: &mut S,
        buf: &mut [u8],
    ) -> io::Result<Option<usize>> {
        let mut prefix = [0u8; 2];
        match stream.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(error),
        }
        let len = u16::from_be_bytes(prefix) as usize;
        if len == 0 || len > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "framed length out of bounds",
            ));
        }
        stream.read_exact(&mut buf[..len]).await?;
        Ok(Some(len))
    }

    /// Writes one length-prefixed message
    pub async fn write_message<S: AsyncWrite + Unpin>(
        stream: &mut S,
        message: &[u8],
    ) -> io::Result<()> {
        debug_assert!(message.len() <= u16::MAX as usize);
        stream
            .write_all(&(message.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(message).await?;
        stream.flush().await
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn message_round_trip() {
            let (mut a, mut b) = tokio::io::duplex(256);
            write_message(&mut a, b"one").await.unwrap();
            write_message(&mut a, b"twotwo").await.unwrap();

            let mut buf = [0u8; 32];
            assert_eq!(read_message(&mut b, &mut buf).await.unwrap(), Some(3));
            assert_eq!(&buf[..3], b"one");
            assert_eq!(read_message(&mut b, &mut buf).await.unwrap(), Some(6));
            assert_eq!(&buf[..6], b"twotwo");

            drop(a);
            assert_eq!(read_message(&mut b, &mut buf).await.unwrap(), None);
        }

        #[tokio::test]
        async fn oversized_lengths_are_rejected() {
            let (mut a, mut b) = tokio::io::duplex(256);
            a.write_all(&100u16.to_be_bytes()).await.unwrap();
            a.write_all(&[0u8; 100]).await.unwrap();

            let mut buf = [0u8; 32];
            let error = read_message(&mut b, &mut buf).await.unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        }

        #[tokio::test]
        async fn zero_lengths_are_rejected() {
            let (mut a, mut b) = tokio::io::duplex(256);
            a.write_all(&0u16.to_be_bytes()).await.unwrap();

            let mut buf = [0u8; 32];
            let error = read_message(&mut b, &mut buf).await.unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        }
    }
}
