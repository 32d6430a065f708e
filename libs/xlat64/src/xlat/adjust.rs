//! Incremental checksum updates (RFC1624) for fragmented transport headers.
//!
//! The first fragment of a datagram carries the transport header but only
//! part of the data the checksum covers, so the checksum cannot be rebuilt
//! from what is in hand. It can, however, be *adjusted*: the translation
//! replaces known 16-bit words (the pseudo-header addresses and the ports)
//! with known new values, and one's-complement arithmetic lets the old
//! checksum absorb exactly that difference.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};

use crate::error::{Error, Result};

const UDP_CHECKSUM_OFFSET: usize = 6;
const TCP_CHECKSUM_OFFSET: usize = 16;

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    folded
}

/// RFC1624 section 3: `HC' = ~(~HC + ~m + m')`
fn adjust(checksum: u16, removed: &[u16], added: &[u16]) -> u16 {
    let mut sum = u32::from(!checksum);
    for word in removed {
        sum += u32::from(!*word);
    }
    for word in added {
        sum += u32::from(*word);
    }
    !fold(sum)
}

fn v4_words(addr: Ipv4Addr) -> [u16; 2] {
    let octets = addr.octets();
    [
        u16::from_be_bytes([octets[0], octets[1]]),
        u16::from_be_bytes([octets[2], octets[3]]),
    ]
}

fn checksum_offset(protocol: IpNextHeaderProtocol) -> Result<usize> {
    match protocol {
        IpNextHeaderProtocols::Udp => Ok(UDP_CHECKSUM_OFFSET),
        IpNextHeaderProtocols::Tcp => Ok(TCP_CHECKSUM_OFFSET),
        // A fragmented ICMP message cannot be translated without
        // reassembling it first
        _ => Err(Error::FragmentedIcmp),
    }
}

fn read_word(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

fn write_word(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Rewrite the ports of an initial-fragment transport header travelling
/// IPv6 to IPv4 and adjust its checksum for the new pseudo-header
pub(crate) fn patch_initial_fragment_6to4(
    payload: &[u8],
    protocol: IpNextHeaderProtocol,
    old_source: Ipv6Addr,
    old_destination: Ipv6Addr,
    new_source: SocketAddrV4,
    new_destination: SocketAddrV4,
) -> Result<Vec<u8>> {
    let offset = checksum_offset(protocol)?;
    if payload.len() < offset + 2 {
        return Err(Error::PacketTooShort {
            expected: offset + 2,
            actual: payload.len(),
        });
    }

    let mut output = payload.to_vec();
    let mut removed: Vec<u16> = Vec::with_capacity(18);
    let mut added: Vec<u16> = Vec::with_capacity(6);
    removed.extend_from_slice(&old_source.segments());
    removed.extend_from_slice(&old_destination.segments());
    removed.push(read_word(&output, 0));
    removed.push(read_word(&output, 2));
    added.extend_from_slice(&v4_words(*new_source.ip()));
    added.extend_from_slice(&v4_words(*new_destination.ip()));
    added.push(new_source.port());
    added.push(new_destination.port());

    write_word(&mut output, 0, new_source.port());
    write_word(&mut output, 2, new_destination.port());
    let patched = adjust(read_word(&output, offset), &removed, &added);
    write_word(&mut output, offset, patched);
    Ok(output)
}

/// Rewrite the ports of an initial-fragment transport header travelling
/// IPv4 to IPv6 and adjust its checksum for the new pseudo-header
pub(crate) fn patch_initial_fragment_4to6(
    payload: &[u8],
    protocol: IpNextHeaderProtocol,
    old_source: Ipv4Addr,
    old_destination: Ipv4Addr,
    new_source: SocketAddrV6,
    new_destination: SocketAddrV6,
) -> Result<Vec<u8>> {
    let offset = checksum_offset(protocol)?;
    if payload.len() < offset + 2 {
        return Err(Error::PacketTooShort {
            expected: offset + 2,
            actual: payload.len(),
        });
    }

    // An IPv4 UDP datagram may omit its checksum, but IPv6 demands one,
    // and a fragment does not hold enough bytes to build it
    let old_checksum = read_word(payload, offset);
    if protocol == IpNextHeaderProtocols::Udp && old_checksum == 0 {
        return Err(Error::MissingUdpChecksum);
    }

    let mut output = payload.to_vec();
    let mut removed: Vec<u16> = Vec::with_capacity(6);
    let mut added: Vec<u16> = Vec::with_capacity(18);
    removed.extend_from_slice(&v4_words(old_source));
    removed.extend_from_slice(&v4_words(old_destination));
    removed.push(read_word(&output, 0));
    removed.push(read_word(&output, 2));
    added.extend_from_slice(&new_source.ip().segments());
    added.extend_from_slice(&new_destination.ip().segments());
    added.push(new_source.port());
    added.push(new_destination.port());

    write_word(&mut output, 0, new_source.port());
    write_word(&mut output, 2, new_destination.port());
    let patched = adjust(old_checksum, &removed, &added);
    write_word(&mut output, offset, patched);
    Ok(output)
}
