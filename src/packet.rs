// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Wire views of the outer transport header and of the inner IP headers.
//!
//! The bind itself treats datagrams as opaque; these views are used above it,
//! by the session layer (outer header) and the routing step (inner src/dst).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, big_endian, little_endian};

/// Discriminator of a transport data message.
pub const DATA_KIND: u8 = 4;

/// Fixed header in front of every encrypted datagram.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
pub struct DataHeader {
    /// Message discriminator; always [`DATA_KIND`].
    pub kind: u8,
    pub reserved: [u8; 3],
    /// Session token of the receiving peer, assigned by the receiver.
    pub receiver_token: little_endian::U32,
    /// AEAD nonce counter.
    pub counter: little_endian::U64,
}

impl DataHeader {
    pub const LEN: usize = size_of::<DataHeader>();

    /// Poly1305 tag trailing the ciphertext.
    pub const TAG_LEN: usize = 16;

    /// Bytes added to a plaintext payload by the outer format.
    pub const OVERHEAD: usize = Self::LEN + Self::TAG_LEN;
}

/// Split a datagram into its data header and the ciphertext-plus-tag body.
///
/// Returns `None` for anything that is not a well-formed data message.
pub fn parse_data(datagram: &[u8]) -> Option<(&DataHeader, &[u8])> {
    let (header, body) = DataHeader::ref_from_prefix(datagram).ok()?;
    if header.kind != DATA_KIND || body.len() < DataHeader::TAG_LEN {
        return None;
    }
    Some((header, body))
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub dscp_ecn: u8,
    pub total_length: big_endian::U16,
    pub identification: big_endian::U16,
    pub flags_fragment_offset: big_endian::U16,
    pub ttl: u8,
    pub protocol: u8,
    pub header_checksum: big_endian::U16,
    pub source: [u8; 4],
    pub destination: [u8; 4],
}

impl Ipv4Header {
    pub const LEN: usize = size_of::<Ipv4Header>();

    /// A minimal header for a payload of `payload_len` bytes. The checksum is
    /// left zero; nothing in the tunnel path verifies it.
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, payload_len: usize) -> Self {
        Ipv4Header {
            version_ihl: 0x45,
            dscp_ecn: 0,
            total_length: big_endian::U16::new((Self::LEN + payload_len) as u16),
            identification: big_endian::U16::ZERO,
            flags_fragment_offset: big_endian::U16::ZERO,
            ttl: 64,
            protocol: 0xfd, // "use for experimentation"
            header_checksum: big_endian::U16::ZERO,
            source: source.octets(),
            destination: destination.octets(),
        }
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
pub struct Ipv6Header {
    pub version_class_flow: [u8; 4],
    pub payload_length: big_endian::U16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: [u8; 16],
    pub destination: [u8; 16],
}

impl Ipv6Header {
    pub const LEN: usize = size_of::<Ipv6Header>();
}

/// Destination address of an inner IP packet, used to pick the peer on the
/// outbound path.
pub fn inner_destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let (header, _) = Ipv4Header::ref_from_prefix(packet).ok()?;
            Some(Ipv4Addr::from(header.destination).into())
        }
        6 => {
            let (header, _) = Ipv6Header::ref_from_prefix(packet).ok()?;
            Some(Ipv6Addr::from(header.destination).into())
        }
        _ => None,
    }
}

/// Source address of an inner IP packet, validated against the sending
/// peer's allowed networks on the inbound path.
pub fn inner_source(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let (header, _) = Ipv4Header::ref_from_prefix(packet).ok()?;
            Some(Ipv4Addr::from(header.source).into())
        }
        6 => {
            let (header, _) = Ipv6Header::ref_from_prefix(packet).ok()?;
            Some(Ipv6Addr::from(header.source).into())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_addresses_v4() {
        let header = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            4,
        );
        let mut packet = header.as_bytes().to_vec();
        packet.extend_from_slice(b"ping");

        assert_eq!(
            inner_source(&packet),
            Some(IpAddr::from(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(
            inner_destination(&packet),
            Some(IpAddr::from(Ipv4Addr::new(10, 0, 0, 2)))
        );
    }

    #[test]
    fn garbage_is_not_ip() {
        assert_eq!(inner_destination(&[]), None);
        assert_eq!(inner_destination(&[0x00, 0x01]), None);
        // version nibble says 4 but the packet is shorter than a header
        assert_eq!(inner_destination(&[0x45, 0x00]), None);
    }

    #[test]
    fn data_header_layout() {
        assert_eq!(DataHeader::LEN, 16);

        let mut datagram = vec![0u8; DataHeader::OVERHEAD];
        datagram[0] = DATA_KIND;
        let (header, body) = parse_data(&datagram).expect("well-formed");
        assert_eq!(header.receiver_token.get(), 0);
        assert_eq!(body.len(), DataHeader::TAG_LEN);

        datagram[0] = 1;
        assert!(parse_data(&datagram).is_none());
    }
}
