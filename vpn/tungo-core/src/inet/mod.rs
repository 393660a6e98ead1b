// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! IP header inspection and prefix filtering.
//!
//! The data plane only ever needs two facts about a plaintext packet: the
//! source address (to enforce what a peer may claim) and the destination
//! address (to pick the peer a TUN packet belongs to). Both are fixed-offset
//! reads once the version nibble is known.

mod cidr;
mod header;

pub use cidr::{AllowedSources, Cidr, CidrParseError};
pub use header::{destination, source, HeaderError};
