use std::net::Ipv4Addr;

use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet_packet::Packet;

use crate::error::{Error, Result};

/// A parsed IPv4 header plus its payload.
///
/// IPv4 options are deliberately not carried: they have no IPv6 equivalent
/// and the headers this translator emits are always 20 bytes (IHL 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub dscp: u8,
    pub ecn: u8,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpNextHeaderProtocol,
    pub source_address: Ipv4Addr,
    pub destination_address: Ipv4Addr,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    /// Parse a packet from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let packet = pnet_packet::ipv4::Ipv4Packet::new(bytes).ok_or(Error::PacketTooShort {
            expected: pnet_packet::ipv4::Ipv4Packet::minimum_packet_size(),
            actual: bytes.len(),
        })?;
        Ok(Self {
            dscp: packet.get_dscp(),
            ecn: packet.get_ecn(),
            identification: packet.get_identification(),
            flags: packet.get_flags(),
            fragment_offset: packet.get_fragment_offset(),
            ttl: packet.get_ttl(),
            protocol: packet.get_next_level_protocol(),
            source_address: packet.get_source(),
            destination_address: packet.get_destination(),
            payload: packet.payload().to_vec(),
        })
    }

    /// The legacy TOS byte, reassembled from DSCP and ECN
    #[must_use]
    pub fn tos(&self) -> u8 {
        (self.dscp << 2) | self.ecn
    }

    /// Whether the Don't-Fragment flag is set
    #[must_use]
    pub fn dont_fragment(&self) -> bool {
        self.flags & Ipv4Flags::DontFragment != 0
    }

    /// Whether the More-Fragments flag is set
    #[must_use]
    pub fn more_fragments(&self) -> bool {
        self.flags & Ipv4Flags::MoreFragments != 0
    }

    /// Whether this packet is any fragment of a larger datagram
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }

    /// Serialize into wire bytes, computing the header checksum
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_length = MutableIpv4Packet::minimum_packet_size() + self.payload.len();
        let mut output = MutableIpv4Packet::owned(vec![0u8; total_length]).unwrap();

        output.set_version(4);
        output.set_header_length(5);
        output.set_dscp(self.dscp);
        output.set_ecn(self.ecn);
        output.set_total_length(u16::try_from(total_length).unwrap());
        output.set_identification(self.identification);
        output.set_flags(self.flags);
        output.set_fragment_offset(self.fragment_offset);
        output.set_ttl(self.ttl);
        output.set_next_level_protocol(self.protocol);
        output.set_source(self.source_address);
        output.set_destination(self.destination_address);
        output.set_payload(&self.payload);

        output.set_checksum(ipv4::checksum(&output.to_immutable()));
        output.packet().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ip::IpNextHeaderProtocols;

    #[test]
    fn test_roundtrip() {
        let packet = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 0x4242,
            flags: Ipv4Flags::DontFragment,
            fragment_offset: 0,
            ttl: 63,
            protocol: IpNextHeaderProtocols::Udp,
            source_address: "192.0.2.1".parse().unwrap(),
            destination_address: "192.168.2.1".parse().unwrap(),
            payload: vec![0xaa; 16],
        };
        let bytes = packet.to_bytes();
        let parsed = Ipv4Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.dont_fragment());
        assert!(!parsed.is_fragment());
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            Ipv4Packet::from_bytes(&[0u8; 10]),
            Err(Error::PacketTooShort { .. })
        ));
    }
}
