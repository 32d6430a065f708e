use std::net::{SocketAddrV4, SocketAddrV6};

use crate::error::Result;
use crate::protocols::TcpPacket;

/// Rebuild an IPv6 TCP segment as IPv4, rewriting both ports to the
/// session's translated transport addresses. Sequence numbers, flags,
/// window and options pass through untouched.
pub fn translate_tcp6_to_tcp4(
    tcp_packet: &[u8],
    new_source: SocketAddrV4,
    new_destination: SocketAddrV4,
) -> Result<Vec<u8>> {
    let mut segment = TcpPacket::from_bytes(
        tcp_packet,
        (*new_source.ip()).into(),
        (*new_destination.ip()).into(),
    )?;
    segment.source = new_source.into();
    segment.destination = new_destination.into();
    Ok(segment.to_bytes())
}

/// Rebuild an IPv4 TCP segment as IPv6
pub fn translate_tcp4_to_tcp6(
    tcp_packet: &[u8],
    new_source: SocketAddrV6,
    new_destination: SocketAddrV6,
) -> Result<Vec<u8>> {
    let mut segment = TcpPacket::from_bytes(
        tcp_packet,
        (*new_source.ip()).into(),
        (*new_destination.ip()).into(),
    )?;
    segment.source = new_source.into();
    segment.destination = new_destination.into();
    Ok(segment.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::tcp::TcpFlags;

    #[test]
    fn test_flags_survive_translation() {
        let original = TcpPacket {
            source: "192.168.2.1:2000".parse().unwrap(),
            destination: "192.0.2.1:61000".parse().unwrap(),
            sequence: 99,
            ack_number: 0,
            flags: TcpFlags::SYN,
            window_size: 1024,
            urgent_pointer: 0,
            options: vec![],
            payload: vec![],
        }
        .to_bytes();

        let translated = translate_tcp4_to_tcp6(
            &original,
            "[64:ff9b::c0a8:201]:2000".parse().unwrap(),
            "[2001:db8::1]:1000".parse().unwrap(),
        )
        .unwrap();

        let reparsed = TcpPacket::from_bytes(
            &translated,
            "64:ff9b::c0a8:201".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        )
        .unwrap();
        assert!(reparsed.is_syn());
        assert_eq!(reparsed.sequence, 99);
        assert_eq!(reparsed.source.port(), 2000);
        assert_eq!(reparsed.destination.port(), 1000);
    }
}
