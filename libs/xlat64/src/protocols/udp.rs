use std::net::{IpAddr, SocketAddr};

use pnet_packet::udp::{self, MutableUdpPacket};
use pnet_packet::Packet;

use crate::error::{Error, Result};

/// A UDP datagram, addressed with the socket addresses its checksum is
/// computed against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub payload: Vec<u8>,
}

impl UdpPacket {
    /// Parse a datagram from raw bytes, adopting the given IP addresses
    pub fn from_bytes(bytes: &[u8], source: IpAddr, destination: IpAddr) -> Result<Self> {
        let packet = pnet_packet::udp::UdpPacket::new(bytes).ok_or(Error::PacketTooShort {
            expected: pnet_packet::udp::UdpPacket::minimum_packet_size(),
            actual: bytes.len(),
        })?;
        Ok(Self {
            source: SocketAddr::new(source, packet.get_source()),
            destination: SocketAddr::new(destination, packet.get_destination()),
            payload: packet.payload().to_vec(),
        })
    }

    /// Serialize into wire bytes, computing the checksum over the
    /// pseudo-header matching the address family
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_length = MutableUdpPacket::minimum_packet_size() + self.payload.len();
        let mut output = MutableUdpPacket::owned(vec![0u8; total_length]).unwrap();

        output.set_source(self.source.port());
        output.set_destination(self.destination.port());
        output.set_length(u16::try_from(total_length).unwrap());
        output.set_payload(&self.payload);

        output.set_checksum(0);
        output.set_checksum(match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(source), IpAddr::V4(destination)) => {
                udp::ipv4_checksum(&output.to_immutable(), &source, &destination)
            }
            (IpAddr::V6(source), IpAddr::V6(destination)) => {
                udp::ipv6_checksum(&output.to_immutable(), &source, &destination)
            }
            _ => unreachable!(),
        });

        output.packet().to_vec()
    }
}
