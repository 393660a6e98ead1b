// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

//= https://www.rfc-editor.org/rfc/rfc791#section-3.1
//# A summary of the contents of the internet header follows:
//#
//#     0                   1                   2                   3
//#     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//#    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//#    |Version|  IHL  |Type of Service|          Total Length         |

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV4_SOURCE_OFFSET: usize = 12;
const IPV4_DESTINATION_OFFSET: usize = 16;

const IPV6_HEADER_LEN: usize = 40;
const IPV6_SOURCE_OFFSET: usize = 8;
const IPV6_DESTINATION_OFFSET: usize = 24;

/// Errors surfaced while reading an IP header
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("packet is shorter than the fixed header")]
    Truncated,
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
}

/// Extracts the source address from a raw IP packet
#[inline]
pub fn source(packet: &[u8]) -> Result<IpAddr, HeaderError> {
    address_at(packet, IPV4_SOURCE_OFFSET, IPV6_SOURCE_OFFSET)
}

/// Extracts the destination address from a raw IP packet
#[inline]
pub fn destination(packet: &[u8]) -> Result<IpAddr, HeaderError> {
    address_at(packet, IPV4_DESTINATION_OFFSET, IPV6_DESTINATION_OFFSET)
}

#[inline]
fn address_at(
    packet: &[u8],
    v4_offset: usize,
    v6_offset: usize,
) -> Result<IpAddr, HeaderError> {
    let first = *packet.first().ok_or(HeaderError::Truncated)?;
    match first >> 4 {
        4 => {
            if packet.len() < IPV4_MIN_HEADER_LEN {
                return Err(HeaderError::Truncated);
            }
            let octets: [u8; 4] = packet[v4_offset..v4_offset + 4]
                .try_into()
                .expect("offset range length is fixed");
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 => {
            if packet.len() < IPV6_HEADER_LEN {
                return Err(HeaderError::Truncated);
            }
            let octets: [u8; 16] = packet[v6_offset..v6_offset + 16]
                .try_into()
                .expect("offset range length is fixed");
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        version => Err(HeaderError::UnsupportedVersion(version)),
    }
}
