//! The two address mapping functions at the heart of the translator.
//!
//! RFC6052 embeds the 32 bits of an IPv4 address into the suffix of an IPv6
//! prefix, starting at the prefix boundary and skipping octet 8 (the "u"
//! octet, which must remain zero). Both directions are implemented with
//! plain octet walks rather than shift arithmetic so the skip rule reads the
//! same way the RFC states it.

use ipnet::Ipv6Net;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};
use crate::ALLOWED_PREFIX_LENS;

/// Embeds an IPv4 address into a translation prefix following the method
/// defined in [RFC6052 Section 2.2](https://datatracker.ietf.org/doc/html/rfc6052#section-2.2)
pub fn addr_4to6(addr: Ipv4Addr, prefix: Ipv6Net) -> Result<Ipv6Addr> {
    if !ALLOWED_PREFIX_LENS.contains(&prefix.prefix_len()) {
        return Err(Error::InvalidPrefixLength(prefix.prefix_len()));
    }

    // Host bits of the prefix (and therefore the suffix and the "u" octet)
    // start out zeroed
    let mut octets = prefix.network().octets();

    // Walk the four IPv4 octets into place, hopping over octet 8
    let mut position = (prefix.prefix_len() / 8) as usize;
    for byte in addr.octets() {
        if position == 8 {
            position += 1;
        }
        octets[position] = byte;
        position += 1;
    }

    Ok(Ipv6Addr::from(octets))
}

/// Extracts the embedded IPv4 address from an IPv6 address, given the
/// translation prefix it was embedded into.
///
/// Fails if the reserved octet carries data, which RFC6052 forbids.
pub fn addr_6to4(addr: Ipv6Addr, prefix: Ipv6Net) -> Result<Ipv4Addr> {
    if !ALLOWED_PREFIX_LENS.contains(&prefix.prefix_len()) {
        return Err(Error::InvalidPrefixLength(prefix.prefix_len()));
    }

    let octets = addr.octets();

    // The "u" octet is only part of the suffix for prefixes shorter than /96
    if prefix.prefix_len() != 96 && octets[8] != 0 {
        return Err(Error::InvalidAddress(addr));
    }

    let mut extracted = [0u8; 4];
    let mut position = (prefix.prefix_len() / 8) as usize;
    for byte in &mut extracted {
        if position == 8 {
            position += 1;
        }
        *byte = octets[position];
        position += 1;
    }

    Ok(Ipv4Addr::from(extracted))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_embed_all_lengths() {
        let addr: Ipv4Addr = "198.51.100.7".parse().unwrap();
        for (len, expected) in [
            (32, "3fff:aa00:c633:6407::"),
            (40, "3fff:aa00:00c6:3364:0007::"),
            (48, "3fff:aa00:0000:c633:0064:0700::"),
            (56, "3fff:aa00:0000:00c6:0033:6407::"),
            (64, "3fff:aa00:0000:0000:00c6:3364:0700::"),
            (96, "3fff:aa00::c633:6407"),
        ] {
            let net = Ipv6Net::new("3fff:aa00::".parse().unwrap(), len).unwrap();
            assert_eq!(
                addr_4to6(addr, net).unwrap(),
                expected.parse::<Ipv6Addr>().unwrap(),
                "prefix length {len}"
            );
        }
    }

    #[test]
    fn test_extract_all_lengths() {
        let addr: Ipv4Addr = "198.51.100.7".parse().unwrap();
        for len in ALLOWED_PREFIX_LENS {
            let net = Ipv6Net::new("3fff:aa00::".parse().unwrap(), len).unwrap();
            let embedded = addr_4to6(addr, net).unwrap();
            assert_eq!(addr_6to4(embedded, net).unwrap(), addr, "prefix length {len}");
        }
    }

    #[test]
    fn test_extract_well_known_prefix() {
        assert_eq!(
            addr_6to4("64:ff9b::c000:201".parse().unwrap(), prefix("64:ff9b::/96")).unwrap(),
            "192.0.2.1".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_reserved_octet_must_be_zero() {
        // Octet 8 carries data, which is not a legal embedding for a /64
        let addr: Ipv6Addr = "3fff:aa00:0:0:ffc6:3364:0700::".parse().unwrap();
        assert_eq!(
            addr_6to4(addr, prefix("3fff:aa00::/64")),
            Err(Error::InvalidAddress(addr))
        );
    }

    #[test]
    fn test_reserved_octet_ignored_for_96() {
        // For a /96 the ninth octet belongs to the prefix, not the suffix
        let net = prefix("64:ff9b::/96");
        assert!(addr_6to4("64:ff9b::1234:5678".parse().unwrap(), net).is_ok());
    }

    #[test]
    fn test_rejects_bad_prefix_length() {
        let net = Ipv6Net::new("64:ff9b::".parse().unwrap(), 80).unwrap();
        assert_eq!(
            addr_4to6("192.0.2.1".parse().unwrap(), net),
            Err(Error::InvalidPrefixLength(80))
        );
    }
}
