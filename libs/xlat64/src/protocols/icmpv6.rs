use std::net::Ipv6Addr;

use pnet_packet::icmpv6::{self, Icmpv6Code, Icmpv6Type, Icmpv6Types, MutableIcmpv6Packet};
use pnet_packet::Packet;

use crate::error::{Error, Result};

/// An ICMPv6 message split the way translation needs it: the 4-byte rest
/// of header apart from the body. The checksum is computed at serialization
/// time against the pseudo-header, so the addresses travel with the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmpv6Message {
    pub icmp_type: Icmpv6Type,
    pub icmp_code: Icmpv6Code,
    pub rest_of_header: [u8; 4],
    pub body: Vec<u8>,
}

impl Icmpv6Message {
    /// Parse a message from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let packet =
            pnet_packet::icmpv6::Icmpv6Packet::new(bytes).ok_or(Error::PacketTooShort {
                expected: pnet_packet::icmpv6::Icmpv6Packet::minimum_packet_size(),
                actual: bytes.len(),
            })?;
        let payload = packet.payload();
        if payload.len() < 4 {
            return Err(Error::PacketTooShort {
                expected: 8,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            icmp_type: packet.get_icmpv6_type(),
            icmp_code: packet.get_icmpv6_code(),
            rest_of_header: [payload[0], payload[1], payload[2], payload[3]],
            body: payload[4..].to_vec(),
        })
    }

    /// Whether this is an echo query (request or reply)
    #[must_use]
    pub fn is_echo(&self) -> bool {
        matches!(
            self.icmp_type,
            Icmpv6Types::EchoRequest | Icmpv6Types::EchoReply
        )
    }

    /// The echo identifier, meaningful only for queries
    #[must_use]
    pub fn echo_id(&self) -> u16 {
        u16::from_be_bytes([self.rest_of_header[0], self.rest_of_header[1]])
    }

    /// Serialize into wire bytes, computing the checksum against the
    /// pseudo-header
    #[must_use]
    pub fn to_bytes(&self, source: Ipv6Addr, destination: Ipv6Addr) -> Vec<u8> {
        let total_length =
            MutableIcmpv6Packet::minimum_packet_size() + 4 + self.body.len();
        let mut output = MutableIcmpv6Packet::owned(vec![0u8; total_length]).unwrap();

        output.set_icmpv6_type(self.icmp_type);
        output.set_icmpv6_code(self.icmp_code);
        let mut payload = self.rest_of_header.to_vec();
        payload.extend_from_slice(&self.body);
        output.set_payload(&payload);

        output.set_checksum(icmpv6::checksum(
            &output.to_immutable(),
            &source,
            &destination,
        ));
        output.packet().to_vec()
    }
}
