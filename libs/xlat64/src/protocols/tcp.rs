use std::net::{IpAddr, SocketAddr};

use pnet_packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpOption, TcpOptionPacket};
use pnet_packet::Packet;

use crate::error::{Error, Result};

/// A TCP segment, addressed with the socket addresses its checksum is
/// computed against
#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub sequence: u32,
    pub ack_number: u32,
    pub flags: u8,
    pub window_size: u16,
    pub urgent_pointer: u16,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    /// Parse a segment from raw bytes, adopting the given IP addresses
    pub fn from_bytes(bytes: &[u8], source: IpAddr, destination: IpAddr) -> Result<Self> {
        let packet = pnet_packet::tcp::TcpPacket::new(bytes).ok_or(Error::PacketTooShort {
            expected: pnet_packet::tcp::TcpPacket::minimum_packet_size(),
            actual: bytes.len(),
        })?;
        Ok(Self {
            source: SocketAddr::new(source, packet.get_source()),
            destination: SocketAddr::new(destination, packet.get_destination()),
            sequence: packet.get_sequence(),
            ack_number: packet.get_acknowledgement(),
            flags: packet.get_flags(),
            window_size: packet.get_window(),
            urgent_pointer: packet.get_urgent_ptr(),
            options: packet.get_options(),
            payload: packet.payload().to_vec(),
        })
    }

    /// Whether the SYN flag is set
    #[must_use]
    pub fn is_syn(&self) -> bool {
        self.flags & TcpFlags::SYN != 0
    }

    /// Whether the FIN flag is set
    #[must_use]
    pub fn is_fin(&self) -> bool {
        self.flags & TcpFlags::FIN != 0
    }

    /// Whether the RST flag is set
    #[must_use]
    pub fn is_rst(&self) -> bool {
        self.flags & TcpFlags::RST != 0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn options_length(&self) -> u8 {
        self.options
            .iter()
            .map(|option| TcpOptionPacket::packet_size(option) as u8)
            .sum::<u8>()
    }

    /// Serialize into wire bytes, computing the checksum over the
    /// pseudo-header matching the address family
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let options_length = self.options_length();
        let total_length = MutableTcpPacket::minimum_packet_size()
            + usize::from(options_length)
            + self.payload.len();
        let mut output = MutableTcpPacket::owned(vec![0u8; total_length]).unwrap();

        output.set_source(self.source.port());
        output.set_destination(self.destination.port());
        output.set_sequence(self.sequence);
        output.set_acknowledgement(self.ack_number);
        output.set_data_offset(5 + (options_length / 4));
        output.set_flags(self.flags);
        output.set_window(self.window_size);
        output.set_urgent_ptr(self.urgent_pointer);
        output.set_options(&self.options);
        output.set_payload(&self.payload);

        output.set_checksum(0);
        output.set_checksum(match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(source), IpAddr::V4(destination)) => {
                tcp::ipv4_checksum(&output.to_immutable(), &source, &destination)
            }
            (IpAddr::V6(source), IpAddr::V6(destination)) => {
                tcp::ipv6_checksum(&output.to_immutable(), &source, &destination)
            }
            _ => unreachable!(),
        });

        output.packet().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(flags: u8) -> TcpPacket {
        TcpPacket {
            source: "192.168.2.1:2000".parse().unwrap(),
            destination: "192.0.2.1:1000".parse().unwrap(),
            sequence: 12345,
            ack_number: 0,
            flags,
            window_size: 8192,
            urgent_pointer: 0,
            options: vec![],
            payload: vec![],
        }
    }

    #[test]
    fn test_flag_helpers() {
        assert!(segment(TcpFlags::SYN).is_syn());
        assert!(segment(TcpFlags::FIN | TcpFlags::ACK).is_fin());
        assert!(segment(TcpFlags::RST).is_rst());
        assert!(!segment(TcpFlags::ACK).is_syn());
    }

    #[test]
    fn test_serialize_and_reparse() {
        let packet = segment(TcpFlags::SYN);
        let bytes = packet.to_bytes();
        let reparsed =
            TcpPacket::from_bytes(&bytes, packet.source.ip(), packet.destination.ip()).unwrap();
        assert_eq!(reparsed.source, packet.source);
        assert_eq!(reparsed.sequence, 12345);
        assert!(reparsed.is_syn());
    }
}
