//! Synthesis of the ICMP errors the pipeline itself originates: answers to
//! packets that could not be translated (no session and none creatable,
//! pool exhaustion, oversized with DF, hop limit spent) and to timed-out
//! pending SYNs.
//!
//! Errors are addressed back along the offending packet's path: source and
//! destination are the offender's, swapped.

use pnet_packet::icmp::{IcmpCode, IcmpType};
use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Type};
use pnet_packet::ip::IpNextHeaderProtocols;

use crate::error::Result;
use crate::protocols::{IcmpMessage, Icmpv6Message, Ipv4Packet, Ipv6Packet};

/// Hop limit used on self-originated errors
const ERROR_TTL: u8 = 64;
/// How much of the offender an ICMPv4 error may quote (576 total)
const ICMPV4_QUOTE_LIMIT: usize = 576 - 20 - 8;
/// How much of the offender an ICMPv6 error may quote (1280 total)
const ICMPV6_QUOTE_LIMIT: usize = 1280 - 40 - 8;

/// Build a full ICMPv4 error packet answering `offending_packet`
pub fn icmpv4_error(
    icmp_type: IcmpType,
    icmp_code: IcmpCode,
    rest_of_header: [u8; 4],
    offending_packet: &[u8],
) -> Result<Vec<u8>> {
    let offender = Ipv4Packet::from_bytes(offending_packet)?;

    let mut quote = offending_packet.to_vec();
    quote.truncate(ICMPV4_QUOTE_LIMIT);

    let message = IcmpMessage {
        icmp_type,
        icmp_code,
        rest_of_header,
        body: quote,
    };

    Ok(Ipv4Packet {
        dscp: 0,
        ecn: 0,
        identification: 0,
        flags: 0,
        fragment_offset: 0,
        ttl: ERROR_TTL,
        protocol: IpNextHeaderProtocols::Icmp,
        source_address: offender.destination_address,
        destination_address: offender.source_address,
        payload: message.to_bytes(),
    }
    .to_bytes())
}

/// Build a full ICMPv6 error packet answering `offending_packet`
pub fn icmpv6_error(
    icmp_type: Icmpv6Type,
    icmp_code: Icmpv6Code,
    rest_of_header: [u8; 4],
    offending_packet: &[u8],
) -> Result<Vec<u8>> {
    let offender = Ipv6Packet::from_bytes(offending_packet)?;

    let mut quote = offending_packet.to_vec();
    quote.truncate(ICMPV6_QUOTE_LIMIT);

    let source_address = offender.destination_address;
    let destination_address = offender.source_address;
    let message = Icmpv6Message {
        icmp_type,
        icmp_code,
        rest_of_header,
        body: quote,
    };

    Ok(Ipv6Packet {
        traffic_class: 0,
        flow_label: 0,
        next_header: IpNextHeaderProtocols::Icmpv6,
        hop_limit: ERROR_TTL,
        source_address,
        destination_address,
        fragment: None,
        payload: message.to_bytes(source_address, destination_address),
    }
    .to_bytes())
}
