// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic plane for the tungo VPN.
//!
//! Three layers, bottom up:
//!
//! * [`seal`] / [`open`] wrap ChaCha20-Poly1305 with the per-direction nonce
//!   counter and anti-replay window.
//! * [`rekey`] is the epoch-indexed key container and rotation state machine.
//! * [`session`] is the transport-aware AEAD envelope a peer's data plane
//!   calls into, and [`handshake`] produces the epoch-0 keys it starts from.

pub mod endpoint;
pub mod handshake;
pub mod open;
pub mod rekey;
pub mod seal;
pub mod session;

mod cipher;

/// Length of every symmetric key in the system
pub const KEY_LEN: usize = 32;

/// A raw directional key, zeroized when dropped
pub type Key = zeroize::Zeroizing<[u8; KEY_LEN]>;
