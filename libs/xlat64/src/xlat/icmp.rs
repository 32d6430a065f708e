//! ICMP/ICMPv6 translation, including the recursive translation of the
//! packets quoted inside error messages.

use std::net::{SocketAddrV4, SocketAddrV6};

use pnet_packet::icmp::IcmpTypes;
use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Types};
use pnet_packet::ip::IpNextHeaderProtocols;

use super::{ip, tcp, type_code, udp};
use crate::error::{Error, Result};
use crate::options::TranslateOptions;
use crate::protocols::{IcmpMessage, Icmpv6Message, Ipv4Packet, Ipv6Packet};

/// Inner packets quoted by ICMPv4 errors keep the total message under the
/// classic 576-byte bound: 20 bytes of IPv4 header plus 8 of ICMP
const ICMPV4_INNER_LIMIT: usize = 576 - 20 - 8;
/// ICMPv6 errors must fit the minimum MTU: 40 IPv6 + 8 ICMPv6
const ICMPV6_INNER_LIMIT: usize = 1280 - 40 - 8;

/// Translate an ICMPv6 message to ICMP. Echo queries keep their payload
/// and take the translated identifier; errors get their quoted packet
/// translated with source and destination swapped.
pub fn translate_icmpv6_to_icmp(
    icmpv6_packet: &[u8],
    new_source: SocketAddrV4,
    new_destination: SocketAddrV4,
    options: &TranslateOptions,
) -> Result<Vec<u8>> {
    let input = Icmpv6Message::from_bytes(icmpv6_packet)?;
    let (icmp_type, icmp_code) =
        type_code::translate_type_and_code_6_to_4(input.icmp_type, input.icmp_code)?;

    if input.is_echo() {
        // The translated identifier rides in the transport addresses
        let id = new_source.port().to_be_bytes();
        return Ok(IcmpMessage {
            icmp_type,
            icmp_code,
            rest_of_header: [id[0], id[1], input.rest_of_header[2], input.rest_of_header[3]],
            body: input.body,
        }
        .to_bytes());
    }

    let rest_of_header = match input.icmp_type {
        Icmpv6Types::PacketTooBig => {
            // An IPv6 path MTU includes 20 bytes the IPv4 path never sees
            let mtu6 = u32::from_be_bytes(input.rest_of_header);
            #[allow(clippy::cast_possible_truncation)]
            let mtu4 = mtu6.saturating_sub(20).clamp(68, 65535) as u16;
            let mtu = mtu4.to_be_bytes();
            [0, 0, mtu[0], mtu[1]]
        }
        Icmpv6Types::ParameterProblem if input.icmp_code == Icmpv6Code(0) => {
            let pointer = type_code::translate_pointer_6_to_4(u32::from_be_bytes(
                input.rest_of_header,
            ))
            .ok_or(Error::UnsupportedIcmpv6Type(input.icmp_type.0))?;
            [pointer, 0, 0, 0]
        }
        _ => [0; 4],
    };

    // The quoted packet travelled the opposite direction
    let inner = translate_inner_6to4(&input.body, new_destination, new_source, options)?;

    Ok(IcmpMessage {
        icmp_type,
        icmp_code,
        rest_of_header,
        body: inner,
    }
    .to_bytes())
}

/// Translate an ICMP message to ICMPv6
pub fn translate_icmp_to_icmpv6(
    icmp_packet: &[u8],
    new_source: SocketAddrV6,
    new_destination: SocketAddrV6,
    options: &TranslateOptions,
) -> Result<Vec<u8>> {
    let input = IcmpMessage::from_bytes(icmp_packet)?;
    let (icmp_type, icmp_code) =
        type_code::translate_type_and_code_4_to_6(input.icmp_type, input.icmp_code)?;

    if input.is_echo() {
        let id = new_source.port().to_be_bytes();
        return Ok(Icmpv6Message {
            icmp_type,
            icmp_code,
            rest_of_header: [id[0], id[1], input.rest_of_header[2], input.rest_of_header[3]],
            body: input.body,
        }
        .to_bytes(*new_source.ip(), *new_destination.ip()));
    }

    let rest_of_header = match (input.icmp_type, input.icmp_code.0) {
        // Fragmentation Needed: lift the next-hop MTU into IPv6 terms,
        // inventing one from the plateau table when the router left it out
        (IcmpTypes::DestinationUnreachable, 4) => {
            let mtu4 = u16::from_be_bytes([input.rest_of_header[2], input.rest_of_header[3]]);
            let mut mtu6 = if mtu4 == 0 {
                let quoted_total_length = if input.body.len() >= 4 {
                    u16::from_be_bytes([input.body[2], input.body[3]])
                } else {
                    0
                };
                u32::from(options.plateau_for(quoted_total_length)) + 20
            } else {
                u32::from(mtu4) + 20
            };
            if options.lower_mtu_fail && mtu6 < 1280 {
                mtu6 = 1280;
            }
            mtu6.to_be_bytes()
        }
        // Protocol Unreachable became "unrecognized next header"; its
        // pointer always lands on the next-header field
        (IcmpTypes::DestinationUnreachable, 2) => [0, 0, 0, 6],
        (IcmpTypes::ParameterProblem, _) => {
            let pointer = type_code::translate_pointer_4_to_6(input.rest_of_header[0])
                .ok_or(Error::UnsupportedIcmpType(input.icmp_type.0))?;
            pointer.to_be_bytes()
        }
        _ => [0; 4],
    };

    let inner = translate_inner_4to6(&input.body, new_destination, new_source, options)?;

    Ok(Icmpv6Message {
        icmp_type,
        icmp_code,
        rest_of_header,
        body: inner,
    }
    .to_bytes(*new_source.ip(), *new_destination.ip()))
}

/// Translate the IPv6 packet quoted inside an error. Like a full
/// translation except the hop limit is copied (the quote is not being
/// forwarded), nothing is ever fragmented, and the result is truncated to
/// the room the outer message has.
fn translate_inner_6to4(
    inner: &[u8],
    new_source: SocketAddrV4,
    new_destination: SocketAddrV4,
    options: &TranslateOptions,
) -> Result<Vec<u8>> {
    let packet = Ipv6Packet::from_bytes(inner)?;

    let payload = if packet.is_non_initial_fragment() {
        packet.payload.clone()
    } else {
        match packet.next_header {
            IpNextHeaderProtocols::Icmpv6 => {
                let quoted = Icmpv6Message::from_bytes(&packet.payload)?;
                if !quoted.is_echo() {
                    return Err(Error::IcmpErrorInIcmpError);
                }
                translate_icmpv6_to_icmp(&packet.payload, new_source, new_destination, options)?
            }
            IpNextHeaderProtocols::Tcp => {
                // Quoted packets are often truncated below a full header;
                // pass the bytes through when they cannot be rebuilt
                tcp::translate_tcp6_to_tcp4(&packet.payload, new_source, new_destination)
                    .unwrap_or_else(|_| {
                        log::debug!("Quoted TCP header is truncated, passing it through");
                        packet.payload.clone()
                    })
            }
            IpNextHeaderProtocols::Udp => {
                udp::translate_udp6_to_udp4(&packet.payload, new_source, new_destination)
                    .unwrap_or_else(|_| {
                        log::debug!("Quoted UDP header is truncated, passing it through");
                        packet.payload.clone()
                    })
            }
            _ => packet.payload.clone(),
        }
    };

    let mut bytes = ip::synthesize_ipv4(
        &packet,
        payload,
        packet.hop_limit,
        new_source,
        new_destination,
        options,
    )
    .to_bytes();
    bytes.truncate(ICMPV4_INNER_LIMIT);
    Ok(bytes)
}

/// Translate the IPv4 packet quoted inside an error
fn translate_inner_4to6(
    inner: &[u8],
    new_source: SocketAddrV6,
    new_destination: SocketAddrV6,
    options: &TranslateOptions,
) -> Result<Vec<u8>> {
    let packet = Ipv4Packet::from_bytes(inner)?;

    let payload = if packet.fragment_offset > 0 {
        packet.payload.clone()
    } else {
        match packet.protocol {
            IpNextHeaderProtocols::Icmp => {
                let quoted = IcmpMessage::from_bytes(&packet.payload)?;
                if !quoted.is_echo() {
                    return Err(Error::IcmpErrorInIcmpError);
                }
                translate_icmp_to_icmpv6(&packet.payload, new_source, new_destination, options)?
            }
            IpNextHeaderProtocols::Tcp => {
                tcp::translate_tcp4_to_tcp6(&packet.payload, new_source, new_destination)
                    .unwrap_or_else(|_| {
                        log::debug!("Quoted TCP header is truncated, passing it through");
                        packet.payload.clone()
                    })
            }
            IpNextHeaderProtocols::Udp => {
                udp::translate_udp4_to_udp6(&packet.payload, new_source, new_destination)
                    .unwrap_or_else(|_| {
                        log::debug!("Quoted UDP header is truncated, passing it through");
                        packet.payload.clone()
                    })
            }
            _ => packet.payload.clone(),
        }
    };

    let mut bytes = ip::synthesize_ipv6(
        &packet,
        payload,
        packet.ttl,
        new_source,
        new_destination,
        options,
    )
    .to_bytes();
    bytes.truncate(ICMPV6_INNER_LIMIT);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::UdpPacket;
    use pnet_packet::icmp::IcmpCode;

    #[test]
    fn test_echo_identifier_rewritten() {
        let request = Icmpv6Message {
            icmp_type: Icmpv6Types::EchoRequest,
            icmp_code: Icmpv6Code(0),
            rest_of_header: [0x12, 0x34, 0x00, 0x05],
            body: b"ping".to_vec(),
        }
        .to_bytes("2001:db8::1".parse().unwrap(), "64:ff9b::c0a8:201".parse().unwrap());

        let translated = translate_icmpv6_to_icmp(
            &request,
            "192.0.2.1:39321".parse().unwrap(),
            "192.168.2.1:39321".parse().unwrap(),
            &TranslateOptions::default(),
        )
        .unwrap();

        let parsed = IcmpMessage::from_bytes(&translated).unwrap();
        assert_eq!(parsed.icmp_type, IcmpTypes::EchoRequest);
        assert_eq!(parsed.echo_id(), 39321);
        // The sequence number is untouched
        assert_eq!(parsed.rest_of_header[3], 0x05);
        assert_eq!(parsed.body, b"ping");
    }

    #[test]
    fn test_packet_too_big_becomes_frag_needed() {
        // A quoted IPv6 UDP packet that the reporting router bounced
        let quoted = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Udp,
            hop_limit: 60,
            source_address: "64:ff9b::c0a8:201".parse().unwrap(),
            destination_address: "2001:db8::1".parse().unwrap(),
            fragment: None,
            payload: UdpPacket {
                source: "[64:ff9b::c0a8:201]:2000".parse().unwrap(),
                destination: "[2001:db8::1]:1000".parse().unwrap(),
                payload: vec![0; 64],
            }
            .to_bytes(),
        }
        .to_bytes();

        let error = Icmpv6Message {
            icmp_type: Icmpv6Types::PacketTooBig,
            icmp_code: Icmpv6Code(0),
            rest_of_header: 1400u32.to_be_bytes(),
            body: quoted,
        }
        .to_bytes("2001:db8::1".parse().unwrap(), "64:ff9b::c0a8:201".parse().unwrap());

        let translated = translate_icmpv6_to_icmp(
            &error,
            "192.0.2.1:61000".parse().unwrap(),
            "192.168.2.1:2000".parse().unwrap(),
            &TranslateOptions::default(),
        )
        .unwrap();

        let parsed = IcmpMessage::from_bytes(&translated).unwrap();
        assert_eq!(parsed.icmp_type, IcmpTypes::DestinationUnreachable);
        assert_eq!(parsed.icmp_code, IcmpCode(4));
        // 1400 - 20
        assert_eq!(
            u16::from_be_bytes([parsed.rest_of_header[2], parsed.rest_of_header[3]]),
            1380
        );

        // The quoted packet came out as IPv4, addresses swapped
        let inner = Ipv4Packet::from_bytes(&parsed.body).unwrap();
        assert_eq!(inner.source_address, "192.168.2.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(inner.destination_address, "192.0.2.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(inner.protocol, IpNextHeaderProtocols::Udp);
    }

    #[test]
    fn test_frag_needed_with_zero_mtu_uses_plateaus() {
        let quoted = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 1,
            flags: 0b010,
            fragment_offset: 0,
            ttl: 60,
            protocol: IpNextHeaderProtocols::Udp,
            source_address: "192.168.2.1".parse().unwrap(),
            destination_address: "192.0.2.1".parse().unwrap(),
            payload: UdpPacket {
                source: "192.168.2.1:2000".parse().unwrap(),
                destination: "192.0.2.1:61000".parse().unwrap(),
                payload: vec![0; 1480],
            }
            .to_bytes(),
        }
        .to_bytes();

        let error = IcmpMessage {
            icmp_type: IcmpTypes::DestinationUnreachable,
            icmp_code: IcmpCode(4),
            rest_of_header: [0, 0, 0, 0],
            body: quoted,
        }
        .to_bytes();

        let translated = translate_icmp_to_icmpv6(
            &error,
            "[64:ff9b::c0a8:201]:2000".parse().unwrap(),
            "[2001:db8::1]:1000".parse().unwrap(),
            &TranslateOptions::default(),
        )
        .unwrap();

        let parsed = Icmpv6Message::from_bytes(&translated).unwrap();
        assert_eq!(parsed.icmp_type, Icmpv6Types::PacketTooBig);
        // Quoted total length is 1508, the plateau below is 1492, plus 20
        assert_eq!(u32::from_be_bytes(parsed.rest_of_header), 1512);
    }

    #[test]
    fn test_icmp_error_in_icmp_error_is_refused() {
        let nested_error = Icmpv6Message {
            icmp_type: Icmpv6Types::DestinationUnreachable,
            icmp_code: Icmpv6Code(0),
            rest_of_header: [0; 4],
            body: vec![],
        };
        let quoted = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Icmpv6,
            hop_limit: 60,
            source_address: "64:ff9b::c0a8:201".parse().unwrap(),
            destination_address: "2001:db8::1".parse().unwrap(),
            fragment: None,
            payload: nested_error
                .to_bytes("64:ff9b::c0a8:201".parse().unwrap(), "2001:db8::1".parse().unwrap()),
        }
        .to_bytes();

        let error = Icmpv6Message {
            icmp_type: Icmpv6Types::TimeExceeded,
            icmp_code: Icmpv6Code(0),
            rest_of_header: [0; 4],
            body: quoted,
        }
        .to_bytes("2001:db8::1".parse().unwrap(), "64:ff9b::c0a8:201".parse().unwrap());

        assert_eq!(
            translate_icmpv6_to_icmp(
                &error,
                "192.0.2.1:61000".parse().unwrap(),
                "192.168.2.1:2000".parse().unwrap(),
                &TranslateOptions::default(),
            ),
            Err(Error::IcmpErrorInIcmpError)
        );
    }
}
