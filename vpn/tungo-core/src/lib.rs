// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pure protocol types for the tungo VPN.
//!
//! This crate holds everything that can be specified bit-exactly without
//! touching a socket or a key: the wire envelopes for stream and datagram
//! transports, the in-band service-packet codec, IP header inspection, CIDR
//! prefix filtering and the anti-replay window. Nothing in here allocates on
//! the packet path.

pub mod inet;
pub mod packet;
pub mod replay;
