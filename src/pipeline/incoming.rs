//! Stage one: parse just enough of an incoming packet to produce the
//! canonical tuple the state tables are keyed by.
//!
//! For ICMP errors the tuple describes the *inner* packet with source and
//! destination swapped, so the error finds the session of the flow it
//! complains about. Non-initial fragments produce address-only tuples.

use pnet_packet::icmp::IcmpTypes;
use pnet_packet::icmpv6::Icmpv6Types;
use pnet_packet::ip::IpNextHeaderProtocols;

use stateful_nat::{L4Proto, Transport4, Transport6, Tuple4, Tuple6};
use xlat64::protocols::{
    IcmpMessage, Icmpv6Message, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IncomingError {
    #[error("Malformed packet")]
    Malformed,
    #[error("Unsupported transport protocol: {0}")]
    UnknownProtocol(u8),
}

/// A packet parsed to its network header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingPacket {
    V4(Ipv4Packet),
    V6(Ipv6Packet),
}

impl IncomingPacket {
    /// Parse the network layer, switching on the version nibble
    pub fn parse(packet: &[u8]) -> Result<Self, IncomingError> {
        match packet.first().map(|byte| byte >> 4) {
            Some(4) => Ok(Self::V4(
                Ipv4Packet::from_bytes(packet).map_err(|_| IncomingError::Malformed)?,
            )),
            Some(6) => Ok(Self::V6(
                Ipv6Packet::from_bytes(packet).map_err(|_| IncomingError::Malformed)?,
            )),
            _ => Err(IncomingError::Malformed),
        }
    }
}

/// A flow tuple of either family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyTuple {
    V4(Tuple4),
    V6(Tuple6),
}

/// A tuple plus its provenance. Tuples lifted out of ICMP errors may only
/// match existing state, never create it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractedTuple {
    pub tuple: AnyTuple,
    pub from_icmp_error: bool,
}

/// Produce the canonical tuple for a parsed packet.
///
/// `Ok(None)` means the packet is valid but not translatable traffic (for
/// example neighbor discovery); the caller should hand it back to the host
/// stack untouched.
pub fn extract_tuple(packet: &IncomingPacket) -> Result<Option<ExtractedTuple>, IncomingError> {
    match packet {
        IncomingPacket::V6(packet) => extract_tuple6(packet),
        IncomingPacket::V4(packet) => extract_tuple4(packet),
    }
}

fn direct6(tuple: Tuple6) -> Option<ExtractedTuple> {
    Some(ExtractedTuple {
        tuple: AnyTuple::V6(tuple),
        from_icmp_error: false,
    })
}

fn direct4(tuple: Tuple4) -> Option<ExtractedTuple> {
    Some(ExtractedTuple {
        tuple: AnyTuple::V4(tuple),
        from_icmp_error: false,
    })
}

fn extract_tuple6(packet: &Ipv6Packet) -> Result<Option<ExtractedTuple>, IncomingError> {
    let l4 = match packet.next_header {
        IpNextHeaderProtocols::Udp => L4Proto::Udp,
        IpNextHeaderProtocols::Tcp => L4Proto::Tcp,
        IpNextHeaderProtocols::Icmpv6 => L4Proto::Icmp,
        protocol => return Err(IncomingError::UnknownProtocol(protocol.0)),
    };

    if packet.is_non_initial_fragment() {
        return Ok(direct6(Tuple6::fragment(
            Transport6::new(packet.source_address, 0),
            Transport6::new(packet.destination_address, 0),
            l4,
        )));
    }

    match l4 {
        L4Proto::Udp => {
            let datagram = UdpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            Ok(direct6(Tuple6::new(
                Transport6::new(packet.source_address, datagram.source.port()),
                Transport6::new(packet.destination_address, datagram.destination.port()),
                L4Proto::Udp,
            )))
        }
        L4Proto::Tcp => {
            let segment = TcpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            Ok(direct6(Tuple6::new(
                Transport6::new(packet.source_address, segment.source.port()),
                Transport6::new(packet.destination_address, segment.destination.port()),
                L4Proto::Tcp,
            )))
        }
        L4Proto::Icmp => {
            let message =
                Icmpv6Message::from_bytes(&packet.payload).map_err(|_| IncomingError::Malformed)?;
            if message.is_echo() {
                let id = message.echo_id();
                return Ok(direct6(Tuple6::new(
                    Transport6::new(packet.source_address, id),
                    Transport6::new(packet.destination_address, id),
                    L4Proto::Icmp,
                )));
            }
            match message.icmp_type {
                Icmpv6Types::DestinationUnreachable
                | Icmpv6Types::PacketTooBig
                | Icmpv6Types::TimeExceeded
                | Icmpv6Types::ParameterProblem => inner_tuple6(&message.body),
                // Neighbor discovery and friends belong to the host stack
                _ => Ok(None),
            }
        }
    }
}

/// Build the tuple for an ICMPv6 error from the packet it quotes, swapping
/// source and destination so the reply-to-the-offender direction matches
/// the session the flow already has
fn inner_tuple6(inner: &[u8]) -> Result<Option<ExtractedTuple>, IncomingError> {
    let packet = Ipv6Packet::from_bytes(inner).map_err(|_| IncomingError::Malformed)?;
    if packet.is_non_initial_fragment() {
        return Err(IncomingError::Malformed);
    }
    let (src_id, dst_id, l4) = match packet.next_header {
        IpNextHeaderProtocols::Udp => {
            let datagram = UdpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            (
                datagram.source.port(),
                datagram.destination.port(),
                L4Proto::Udp,
            )
        }
        IpNextHeaderProtocols::Tcp => {
            let segment = TcpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            (
                segment.source.port(),
                segment.destination.port(),
                L4Proto::Tcp,
            )
        }
        IpNextHeaderProtocols::Icmpv6 => {
            let quoted =
                Icmpv6Message::from_bytes(&packet.payload).map_err(|_| IncomingError::Malformed)?;
            // An error quoting another error is not legal traffic
            if !quoted.is_echo() {
                return Err(IncomingError::Malformed);
            }
            (quoted.echo_id(), quoted.echo_id(), L4Proto::Icmp)
        }
        protocol => return Err(IncomingError::UnknownProtocol(protocol.0)),
    };

    Ok(Some(ExtractedTuple {
        tuple: AnyTuple::V6(Tuple6::new(
            Transport6::new(packet.destination_address, dst_id),
            Transport6::new(packet.source_address, src_id),
            l4,
        )),
        from_icmp_error: true,
    }))
}

fn extract_tuple4(packet: &Ipv4Packet) -> Result<Option<ExtractedTuple>, IncomingError> {
    let l4 = match packet.protocol {
        IpNextHeaderProtocols::Udp => L4Proto::Udp,
        IpNextHeaderProtocols::Tcp => L4Proto::Tcp,
        IpNextHeaderProtocols::Icmp => L4Proto::Icmp,
        protocol => return Err(IncomingError::UnknownProtocol(protocol.0)),
    };

    if packet.fragment_offset > 0 {
        return Ok(direct4(Tuple4::fragment(
            Transport4::new(packet.source_address, 0),
            Transport4::new(packet.destination_address, 0),
            l4,
        )));
    }

    match l4 {
        L4Proto::Udp => {
            let datagram = UdpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            Ok(direct4(Tuple4::new(
                Transport4::new(packet.source_address, datagram.source.port()),
                Transport4::new(packet.destination_address, datagram.destination.port()),
                L4Proto::Udp,
            )))
        }
        L4Proto::Tcp => {
            let segment = TcpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            Ok(direct4(Tuple4::new(
                Transport4::new(packet.source_address, segment.source.port()),
                Transport4::new(packet.destination_address, segment.destination.port()),
                L4Proto::Tcp,
            )))
        }
        L4Proto::Icmp => {
            let message =
                IcmpMessage::from_bytes(&packet.payload).map_err(|_| IncomingError::Malformed)?;
            if message.is_echo() {
                let id = message.echo_id();
                return Ok(direct4(Tuple4::new(
                    Transport4::new(packet.source_address, id),
                    Transport4::new(packet.destination_address, id),
                    L4Proto::Icmp,
                )));
            }
            match message.icmp_type {
                IcmpTypes::DestinationUnreachable
                | IcmpTypes::TimeExceeded
                | IcmpTypes::ParameterProblem => inner_tuple4(&message.body),
                _ => Ok(None),
            }
        }
    }
}

fn inner_tuple4(inner: &[u8]) -> Result<Option<ExtractedTuple>, IncomingError> {
    let packet = Ipv4Packet::from_bytes(inner).map_err(|_| IncomingError::Malformed)?;
    if packet.fragment_offset > 0 {
        return Err(IncomingError::Malformed);
    }
    let (src_id, dst_id, l4) = match packet.protocol {
        IpNextHeaderProtocols::Udp => {
            let datagram = UdpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            (
                datagram.source.port(),
                datagram.destination.port(),
                L4Proto::Udp,
            )
        }
        IpNextHeaderProtocols::Tcp => {
            let segment = TcpPacket::from_bytes(
                &packet.payload,
                packet.source_address.into(),
                packet.destination_address.into(),
            )
            .map_err(|_| IncomingError::Malformed)?;
            (
                segment.source.port(),
                segment.destination.port(),
                L4Proto::Tcp,
            )
        }
        IpNextHeaderProtocols::Icmp => {
            let quoted =
                IcmpMessage::from_bytes(&packet.payload).map_err(|_| IncomingError::Malformed)?;
            if !quoted.is_echo() {
                return Err(IncomingError::Malformed);
            }
            (quoted.echo_id(), quoted.echo_id(), L4Proto::Icmp)
        }
        protocol => return Err(IncomingError::UnknownProtocol(protocol.0)),
    };

    Ok(Some(ExtractedTuple {
        tuple: AnyTuple::V4(Tuple4::new(
            Transport4::new(packet.destination_address, dst_id),
            Transport4::new(packet.source_address, src_id),
            l4,
        )),
        from_icmp_error: true,
    }))
}
