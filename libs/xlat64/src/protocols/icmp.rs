use pnet_packet::icmp::{self, IcmpCode, IcmpType, IcmpTypes, MutableIcmpPacket};
use pnet_packet::Packet;

use crate::error::{Error, Result};

/// An ICMP message split the way translation needs it: the 4-byte rest of
/// header (identifier/sequence for queries, MTU for Fragmentation Needed,
/// pointer for Parameter Problem) apart from the body that follows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpMessage {
    pub icmp_type: IcmpType,
    pub icmp_code: IcmpCode,
    pub rest_of_header: [u8; 4],
    pub body: Vec<u8>,
}

impl IcmpMessage {
    /// Parse a message from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let packet = pnet_packet::icmp::IcmpPacket::new(bytes).ok_or(Error::PacketTooShort {
            expected: pnet_packet::icmp::IcmpPacket::minimum_packet_size(),
            actual: bytes.len(),
        })?;
        // pnet's header stops at the checksum; the rest of header is the
        // first 4 payload bytes
        let payload = packet.payload();
        if payload.len() < 4 {
            return Err(Error::PacketTooShort {
                expected: 8,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            icmp_type: packet.get_icmp_type(),
            icmp_code: packet.get_icmp_code(),
            rest_of_header: [payload[0], payload[1], payload[2], payload[3]],
            body: payload[4..].to_vec(),
        })
    }

    /// Whether this is an echo query (request or reply)
    #[must_use]
    pub fn is_echo(&self) -> bool {
        matches!(self.icmp_type, IcmpTypes::EchoRequest | IcmpTypes::EchoReply)
    }

    /// The echo identifier, meaningful only for queries
    #[must_use]
    pub fn echo_id(&self) -> u16 {
        u16::from_be_bytes([self.rest_of_header[0], self.rest_of_header[1]])
    }

    /// Serialize into wire bytes, computing the checksum
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_length =
            MutableIcmpPacket::minimum_packet_size() + 4 + self.body.len();
        let mut output = MutableIcmpPacket::owned(vec![0u8; total_length]).unwrap();

        output.set_icmp_type(self.icmp_type);
        output.set_icmp_code(self.icmp_code);
        let mut payload = self.rest_of_header.to_vec();
        payload.extend_from_slice(&self.body);
        output.set_payload(&payload);

        output.set_checksum(icmp::checksum(&output.to_immutable()));
        output.packet().to_vec()
    }
}
