use std::net::Ipv6Addr;

use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv6::MutableIpv6Packet;
use pnet_packet::Packet;

use crate::error::{Error, Result};

/// The IPv6 Fragment extension header, RFC8200 section 4.5.
///
/// pnet does not model extension headers, so this one is read and written
/// by hand. It is always 8 bytes:
///
/// ```text
/// next header (1) | reserved (1) | offset+flags (2) | identification (4)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Offset of this fragment within the original payload, in 8-byte units
    pub offset: u16,
    /// The M flag: more fragments follow
    pub more: bool,
    /// Datagram identification
    pub id: u32,
}

impl FragmentHeader {
    pub const SIZE: usize = 8;

    /// Parse a fragment header, returning it and the protocol of the data
    /// that follows
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, IpNextHeaderProtocol)> {
        if bytes.len() < Self::SIZE {
            return Err(Error::PacketTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let offset_and_flags = u16::from_be_bytes([bytes[2], bytes[3]]);
        Ok((
            Self {
                offset: offset_and_flags >> 3,
                more: offset_and_flags & 1 != 0,
                id: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            },
            IpNextHeaderProtocol(bytes[0]),
        ))
    }

    /// Serialize, recording the protocol of the data that follows
    #[must_use]
    pub fn to_bytes(self, next_header: IpNextHeaderProtocol) -> [u8; Self::SIZE] {
        let offset_and_flags = (self.offset << 3) | u16::from(self.more);
        let id = self.id.to_be_bytes();
        [
            next_header.0,
            0,
            (offset_and_flags >> 8) as u8,
            (offset_and_flags & 0xff) as u8,
            id[0],
            id[1],
            id[2],
            id[3],
        ]
    }
}

/// A parsed IPv6 header plus its payload.
///
/// `next_header` identifies the payload itself; when a fragment header was
/// present it has been peeled off into `fragment` and `payload` starts at
/// the transport data. Extension headers other than Fragment are not
/// traversed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub next_header: IpNextHeaderProtocol,
    pub hop_limit: u8,
    pub source_address: Ipv6Addr,
    pub destination_address: Ipv6Addr,
    pub fragment: Option<FragmentHeader>,
    pub payload: Vec<u8>,
}

impl Ipv6Packet {
    /// Parse a packet from raw bytes, peeling off a fragment header when
    /// one leads the payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let packet = pnet_packet::ipv6::Ipv6Packet::new(bytes).ok_or(Error::PacketTooShort {
            expected: pnet_packet::ipv6::Ipv6Packet::minimum_packet_size(),
            actual: bytes.len(),
        })?;

        let mut next_header = packet.get_next_header();
        let mut fragment = None;
        let mut payload = packet.payload().to_vec();

        if next_header == IpNextHeaderProtocols::Ipv6Frag {
            let (header, inner_protocol) = FragmentHeader::from_bytes(&payload)?;
            fragment = Some(header);
            next_header = inner_protocol;
            payload.drain(..FragmentHeader::SIZE);
        }

        Ok(Self {
            traffic_class: packet.get_traffic_class(),
            flow_label: packet.get_flow_label(),
            next_header,
            hop_limit: packet.get_hop_limit(),
            source_address: packet.get_source(),
            destination_address: packet.get_destination(),
            fragment,
            payload,
        })
    }

    /// Whether this packet is a non-initial fragment, i.e. its transport
    /// header lives in some other packet
    #[must_use]
    pub fn is_non_initial_fragment(&self) -> bool {
        self.fragment.is_some_and(|fragment| fragment.offset != 0)
    }

    /// Serialize into wire bytes, re-inserting the fragment header when
    /// one is carried
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let extension_length = if self.fragment.is_some() {
            FragmentHeader::SIZE
        } else {
            0
        };
        let total_length = pnet_packet::ipv6::MutableIpv6Packet::minimum_packet_size()
            + extension_length
            + self.payload.len();
        let mut output = MutableIpv6Packet::owned(vec![0u8; total_length]).unwrap();

        output.set_version(6);
        output.set_traffic_class(self.traffic_class);
        output.set_flow_label(self.flow_label);
        output.set_payload_length(u16::try_from(extension_length + self.payload.len()).unwrap());
        output.set_hop_limit(self.hop_limit);
        output.set_source(self.source_address);
        output.set_destination(self.destination_address);

        match self.fragment {
            Some(fragment) => {
                output.set_next_header(IpNextHeaderProtocols::Ipv6Frag);
                let mut body = fragment.to_bytes(self.next_header).to_vec();
                body.extend_from_slice(&self.payload);
                output.set_payload(&body);
            }
            None => {
                output.set_next_header(self.next_header);
                output.set_payload(&self.payload);
            }
        }

        output.packet().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_plain() {
        let packet = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Udp,
            hop_limit: 63,
            source_address: "2001:db8::1".parse().unwrap(),
            destination_address: "64:ff9b::c000:201".parse().unwrap(),
            fragment: None,
            payload: vec![0x55; 24],
        };
        let parsed = Ipv6Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_roundtrip_with_fragment_header() {
        let packet = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Udp,
            hop_limit: 63,
            source_address: "2001:db8::1".parse().unwrap(),
            destination_address: "64:ff9b::c000:201".parse().unwrap(),
            fragment: Some(FragmentHeader {
                offset: 185,
                more: true,
                id: 0xdead_beef,
            }),
            payload: vec![0x55; 24],
        };
        let bytes = packet.to_bytes();
        // The wire next-header must be the fragment extension
        assert_eq!(bytes[6], 44);
        let parsed = Ipv6Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.is_non_initial_fragment());
    }

    #[test]
    fn test_fragment_header_flags() {
        let header = FragmentHeader {
            offset: 1,
            more: false,
            id: 7,
        };
        let bytes = header.to_bytes(IpNextHeaderProtocols::Tcp);
        let (parsed, protocol) = FragmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(protocol, IpNextHeaderProtocols::Tcp);
    }
}
