//! Translation functions that convert whole packets between IPv4 and IPv6.

use std::net::{SocketAddrV4, SocketAddrV6};

use pnet_packet::ip::IpNextHeaderProtocols;

use super::{adjust, frag, icmp, tcp, udp};
use crate::error::{Error, Result};
use crate::options::TranslateOptions;
use crate::protocols::{FragmentHeader, Ipv4Packet, Ipv6Packet};

/// Translates an IPv6 packet into a single IPv4 packet. The payload is
/// translated recursively as needed; ports (or the ICMP identifier) are
/// rewritten to the given transport addresses.
pub fn translate_ipv6_to_ipv4(
    input: &Ipv6Packet,
    new_source: SocketAddrV4,
    new_destination: SocketAddrV4,
    options: &TranslateOptions,
) -> Result<Vec<u8>> {
    // Routers decrement on forwarding; a packet that arrives on its last
    // hop earns a Time Exceeded instead of a translation
    let ttl = input.hop_limit.checked_sub(1).ok_or(Error::HopLimitExceeded)?;
    if ttl == 0 {
        return Err(Error::HopLimitExceeded);
    }

    let new_payload = if input.is_non_initial_fragment() {
        // No transport header to rewrite; the bytes pass through
        input.payload.clone()
    } else if input.fragment.is_some() {
        // An initial fragment holds the header but not all the bytes its
        // checksum covers, so the checksum is adjusted rather than rebuilt
        adjust::patch_initial_fragment_6to4(
            &input.payload,
            input.next_header,
            input.source_address,
            input.destination_address,
            new_source,
            new_destination,
        )?
    } else {
        match input.next_header {
            IpNextHeaderProtocols::Icmpv6 => {
                icmp::translate_icmpv6_to_icmp(&input.payload, new_source, new_destination, options)?
            }
            IpNextHeaderProtocols::Tcp => {
                tcp::translate_tcp6_to_tcp4(&input.payload, new_source, new_destination)?
            }
            IpNextHeaderProtocols::Udp => {
                udp::translate_udp6_to_udp4(&input.payload, new_source, new_destination)?
            }
            protocol => return Err(Error::UnsupportedProtocol(protocol.0)),
        }
    };

    Ok(synthesize_ipv4(input, new_payload, ttl, new_source, new_destination, options).to_bytes())
}

/// Translates an IPv4 packet into one or more IPv6 packets. Oversized
/// packets without DF are split into a fragment chain bounded by the
/// minimum IPv6 MTU; oversized packets with DF fail with
/// [`Error::FragmentationNeeded`].
pub fn translate_ipv4_to_ipv6(
    input: &Ipv4Packet,
    new_source: SocketAddrV6,
    new_destination: SocketAddrV6,
    options: &TranslateOptions,
) -> Result<Vec<Vec<u8>>> {
    let hop_limit = input.ttl.checked_sub(1).ok_or(Error::HopLimitExceeded)?;
    if hop_limit == 0 {
        return Err(Error::HopLimitExceeded);
    }

    let new_payload = if input.fragment_offset > 0 {
        input.payload.clone()
    } else if input.is_fragment() {
        adjust::patch_initial_fragment_4to6(
            &input.payload,
            input.protocol,
            input.source_address,
            input.destination_address,
            new_source,
            new_destination,
        )?
    } else {
        match input.protocol {
            IpNextHeaderProtocols::Icmp => {
                icmp::translate_icmp_to_icmpv6(&input.payload, new_source, new_destination, options)?
            }
            IpNextHeaderProtocols::Tcp => {
                tcp::translate_tcp4_to_tcp6(&input.payload, new_source, new_destination)?
            }
            IpNextHeaderProtocols::Udp => {
                udp::translate_udp4_to_udp6(&input.payload, new_source, new_destination)?
            }
            protocol => return Err(Error::UnsupportedProtocol(protocol.0)),
        }
    };

    let packet = synthesize_ipv6(input, new_payload, hop_limit, new_source, new_destination, options);
    frag::emit(
        packet,
        input.dont_fragment(),
        u32::from(input.identification),
        options,
    )
}

/// Fill in an IPv4 header around a translated payload. Used for outer
/// packets (with the hop limit already decremented) and for the packets
/// quoted inside ICMP errors (hop limit copied).
pub(crate) fn synthesize_ipv4(
    input: &Ipv6Packet,
    payload: Vec<u8>,
    ttl: u8,
    new_source: SocketAddrV4,
    new_destination: SocketAddrV4,
    options: &TranslateOptions,
) -> Ipv4Packet {
    let tos = if options.reset_tos {
        options.new_tos
    } else {
        input.traffic_class
    };

    // Identification and the fragment fields come from the fragment header
    // when there is one; otherwise the identification either gets derived
    // or zeroed, by configuration
    let (identification, flags, fragment_offset) = match input.fragment {
        #[allow(clippy::cast_possible_truncation)]
        Some(fragment) => (
            fragment.id as u16,
            u8::from(fragment.more),
            fragment.offset,
        ),
        None => (
            if options.build_ipv4_id {
                derive_identification(input)
            } else {
                0
            },
            if options.df_always_on { 0b010 } else { 0 },
            0,
        ),
    };

    Ipv4Packet {
        dscp: tos >> 2,
        ecn: tos & 0b11,
        identification,
        flags,
        fragment_offset,
        ttl,
        protocol: match input.next_header {
            IpNextHeaderProtocols::Icmpv6 => IpNextHeaderProtocols::Icmp,
            protocol => protocol,
        },
        source_address: *new_source.ip(),
        destination_address: *new_destination.ip(),
        payload,
    }
}

/// Fill in an IPv6 header around a translated payload. Fragmented input
/// keeps its fragment header (identification widened to 32 bits); whether
/// the result must then be split is the fragmenter's business.
pub(crate) fn synthesize_ipv6(
    input: &Ipv4Packet,
    payload: Vec<u8>,
    hop_limit: u8,
    new_source: SocketAddrV6,
    new_destination: SocketAddrV6,
    options: &TranslateOptions,
) -> Ipv6Packet {
    Ipv6Packet {
        traffic_class: if options.reset_traffic_class {
            0
        } else {
            input.tos()
        },
        flow_label: 0,
        next_header: match input.protocol {
            IpNextHeaderProtocols::Icmp => IpNextHeaderProtocols::Icmpv6,
            protocol => protocol,
        },
        hop_limit,
        source_address: *new_source.ip(),
        destination_address: *new_destination.ip(),
        fragment: input.is_fragment().then_some(FragmentHeader {
            offset: input.fragment_offset,
            more: input.more_fragments(),
            id: u32::from(input.identification),
        }),
        payload,
    }
}

/// Fold the source, destination and flow label into a 16-bit IPv4
/// identification for packets that arrive without a fragment header
fn derive_identification(input: &Ipv6Packet) -> u16 {
    let mut accumulator = input.flow_label;
    for octets in [
        input.source_address.octets(),
        input.destination_address.octets(),
    ] {
        for pair in octets.chunks_exact(2) {
            accumulator = accumulator.wrapping_add(u32::from(u16::from_be_bytes([pair[0], pair[1]])));
        }
    }
    while accumulator > 0xffff {
        accumulator = (accumulator & 0xffff) + (accumulator >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    let folded = accumulator as u16;
    folded
}
