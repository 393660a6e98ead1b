// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A point-to-multipoint TUN VPN.
//!
//! One server accepts many authenticated clients over TCP, UDP or WebSocket
//! and forwards IP datagrams between each client's TUN device and its own.
//! Sessions are established with a Noise IK handshake, protected with
//! ChaCha20-Poly1305 under rotating epochs, and controlled in band through
//! service packets multiplexed on the encrypted channel.
//!
//! The crate splits along the system's seams:
//!
//! * [`config`] is what the embedder supplies: settings, allowed peers and a
//!   revision stream for revocation.
//! * [`tun`] is the device contract; platform TUN creation lives behind
//!   [`tun::TunFactory`].
//! * [`session`] owns peers: the repository indexes, the registrar and the
//!   idle reaper.
//! * [`dataplane`] moves packets: per-connection ingress workers and the
//!   TUN-to-wire handlers.
//! * [`control`] is the in-band control plane: rekey handling, the client
//!   rekey scheduler and keepalive.
//! * [`transport`] binds the above to TCP, UDP and WebSocket listeners, and
//!   [`server`] / [`client`] assemble whole endpoints.

pub mod client;
pub mod config;
pub mod control;
pub mod dataplane;
pub mod error;
pub mod server;
pub mod session;
pub mod transport;
pub mod tun;

pub use error::{ConnectionError, FatalError};
pub use transport::Transport;
