use std::net::{SocketAddrV4, SocketAddrV6};

use crate::error::Result;
use crate::protocols::UdpPacket;

/// Rebuild an IPv6 UDP datagram as IPv4, rewriting both ports to the
/// session's translated transport addresses and recomputing the checksum
/// over the new pseudo-header
pub fn translate_udp6_to_udp4(
    udp_packet: &[u8],
    new_source: SocketAddrV4,
    new_destination: SocketAddrV4,
) -> Result<Vec<u8>> {
    let input = UdpPacket::from_bytes(udp_packet, (*new_source.ip()).into(), (*new_destination.ip()).into())?;
    Ok(UdpPacket {
        source: new_source.into(),
        destination: new_destination.into(),
        payload: input.payload,
    }
    .to_bytes())
}

/// Rebuild an IPv4 UDP datagram as IPv6
pub fn translate_udp4_to_udp6(
    udp_packet: &[u8],
    new_source: SocketAddrV6,
    new_destination: SocketAddrV6,
) -> Result<Vec<u8>> {
    let input = UdpPacket::from_bytes(udp_packet, (*new_source.ip()).into(), (*new_destination.ip()).into())?;
    Ok(UdpPacket {
        source: new_source.into(),
        destination: new_destination.into(),
        payload: input.payload,
    }
    .to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_are_rewritten() {
        let original = UdpPacket {
            source: "[2001:db8::1]:1000".parse().unwrap(),
            destination: "[64:ff9b::c0a8:201]:2000".parse().unwrap(),
            payload: b"hello".to_vec(),
        }
        .to_bytes();

        let translated = translate_udp6_to_udp4(
            &original,
            "192.0.2.1:61000".parse().unwrap(),
            "192.168.2.1:2000".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(u16::from_be_bytes([translated[0], translated[1]]), 61000);
        assert_eq!(u16::from_be_bytes([translated[2], translated[3]]), 2000);
        assert_eq!(&translated[8..], b"hello");
    }
}
