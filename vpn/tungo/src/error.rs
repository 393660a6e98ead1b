// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy.
//!
//! Per-packet problems never surface here; workers drop the packet and move
//! on. [`ConnectionError`] tears down exactly one peer. [`FatalError`]
//! propagates to the supervisor and shuts the endpoint down.

use tungo_crypto::handshake;

/// Ends one connection; the rest of the endpoint keeps running
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] handshake::Error),
    #[error("handshake deadline exceeded")]
    HandshakeTimeout,
    #[error("frame length is out of bounds")]
    FrameOutOfBounds,
    #[error("ciphertext failed authentication")]
    Decrypt,
    #[error("peer is closed")]
    PeerClosed,
    #[error("peer tore the session down")]
    SessionReset,
    /// The rekey space is spent; reconnecting establishes a fresh session
    #[error("rekey epoch space exhausted")]
    EpochExhausted,
    /// The server stopped answering keepalives
    #[error("server unreachable")]
    ServerUnreachable,
    #[error("websocket transport failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ConnectionError {
    /// Whether a client should re-handshake after this error
    #[inline]
    pub fn is_reconnectable(&self) -> bool {
        matches!(
            self,
            Self::EpochExhausted
                | Self::SessionReset
                | Self::ServerUnreachable
                | Self::HandshakeTimeout
                | Self::Io(_)
        )
    }
}

/// Shuts the endpoint down
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("configuration is invalid: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("listener could not be created: {0}")]
    Listener(std::io::Error),
    #[error("tun device could not be created: {0}")]
    Tun(std::io::Error),
}
