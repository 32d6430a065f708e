//! Mapping between ICMP and ICMPv6 types, codes and Parameter Problem
//! pointers, following RFC6145 sections 4.2 and 5.2.

use pnet_packet::icmp::{destination_unreachable, IcmpCode, IcmpType, IcmpTypes};
use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Type, Icmpv6Types};

use crate::error::{Error, Result};

/// Translate an ICMP type and code to their ICMPv6 equivalents.
///
/// Fragmentation Needed maps to Packet Too Big and Protocol Unreachable to
/// a Parameter Problem pointing at the next-header field; the caller fills
/// in the rest of header those types require.
pub fn translate_type_and_code_4_to_6(
    icmp_type: IcmpType,
    icmp_code: IcmpCode,
) -> Result<(Icmpv6Type, Icmpv6Code)> {
    match (icmp_type, icmp_code) {
        (IcmpTypes::EchoRequest, _) => Ok((Icmpv6Types::EchoRequest, Icmpv6Code(0))),
        (IcmpTypes::EchoReply, _) => Ok((Icmpv6Types::EchoReply, Icmpv6Code(0))),

        (
            IcmpTypes::DestinationUnreachable,
            destination_unreachable::IcmpCodes::FragmentationRequiredAndDFFlagSet,
        ) => Ok((Icmpv6Types::PacketTooBig, Icmpv6Code(0))),

        // Protocol Unreachable has no unreachable-code equivalent; it
        // becomes "unrecognized next header" at the fixed pointer
        (
            IcmpTypes::DestinationUnreachable,
            destination_unreachable::IcmpCodes::DestinationProtocolUnreachable,
        ) => Ok((Icmpv6Types::ParameterProblem, Icmpv6Code(1))),

        (IcmpTypes::DestinationUnreachable, icmp_code) => Ok((
            Icmpv6Types::DestinationUnreachable,
            Icmpv6Code(match icmp_code.0 {
                // Administratively prohibited flavors
                9 | 10 | 13 | 15 => 1,
                // Port unreachable
                3 => 4,
                // Everything else collapses to "no route to destination"
                _ => 0,
            }),
        )),

        (IcmpTypes::TimeExceeded, icmp_code) => {
            Ok((Icmpv6Types::TimeExceeded, Icmpv6Code(icmp_code.0)))
        }

        (IcmpTypes::ParameterProblem, IcmpCode(0 | 2)) => {
            Ok((Icmpv6Types::ParameterProblem, Icmpv6Code(0)))
        }

        (icmp_type, _) => Err(Error::UnsupportedIcmpType(icmp_type.0)),
    }
}

/// Translate an ICMPv6 type and code to their ICMP equivalents
pub fn translate_type_and_code_6_to_4(
    icmp_type: Icmpv6Type,
    icmp_code: Icmpv6Code,
) -> Result<(IcmpType, IcmpCode)> {
    match (icmp_type, icmp_code) {
        (Icmpv6Types::EchoRequest, _) => Ok((IcmpTypes::EchoRequest, IcmpCode(0))),
        (Icmpv6Types::EchoReply, _) => Ok((IcmpTypes::EchoReply, IcmpCode(0))),

        (Icmpv6Types::PacketTooBig, _) => Ok((
            IcmpTypes::DestinationUnreachable,
            destination_unreachable::IcmpCodes::FragmentationRequiredAndDFFlagSet,
        )),

        (Icmpv6Types::DestinationUnreachable, icmp_code) => Ok((
            IcmpTypes::DestinationUnreachable,
            IcmpCode(match icmp_code.0 {
                // Communication administratively prohibited
                1 => 10,
                // Port unreachable
                4 => 3,
                // No route, beyond scope, address unreachable
                _ => 1,
            }),
        )),

        (Icmpv6Types::TimeExceeded, icmp_code) => {
            Ok((IcmpTypes::TimeExceeded, IcmpCode(icmp_code.0)))
        }

        // Erroneous header field, with the pointer translated separately
        (Icmpv6Types::ParameterProblem, Icmpv6Code(0)) => {
            Ok((IcmpTypes::ParameterProblem, IcmpCode(0)))
        }
        // Unrecognized next header
        (Icmpv6Types::ParameterProblem, Icmpv6Code(1)) => Ok((
            IcmpTypes::DestinationUnreachable,
            destination_unreachable::IcmpCodes::DestinationProtocolUnreachable,
        )),

        (icmp_type, _) => Err(Error::UnsupportedIcmpv6Type(icmp_type.0)),
    }
}

/// Map an IPv4 Parameter Problem pointer onto the IPv6 header layout.
/// Fields with no equivalent yield `None`, which drops the message.
#[must_use]
pub fn translate_pointer_4_to_6(pointer: u8) -> Option<u32> {
    match pointer {
        0 => Some(0),
        1 => Some(1),
        2 | 3 => Some(4),
        8 => Some(7),
        9 => Some(6),
        12..=15 => Some(8),
        16..=19 => Some(24),
        _ => None,
    }
}

/// Map an IPv6 Parameter Problem pointer onto the IPv4 header layout
#[must_use]
pub fn translate_pointer_6_to_4(pointer: u32) -> Option<u8> {
    match pointer {
        0 => Some(0),
        1 => Some(1),
        4 | 5 => Some(2),
        6 => Some(9),
        7 => Some(8),
        8..=23 => Some(12),
        24..=39 => Some(16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptb_maps_to_frag_needed_and_back() {
        assert_eq!(
            translate_type_and_code_6_to_4(Icmpv6Types::PacketTooBig, Icmpv6Code(0)).unwrap(),
            (
                IcmpTypes::DestinationUnreachable,
                destination_unreachable::IcmpCodes::FragmentationRequiredAndDFFlagSet
            )
        );
        assert_eq!(
            translate_type_and_code_4_to_6(
                IcmpTypes::DestinationUnreachable,
                destination_unreachable::IcmpCodes::FragmentationRequiredAndDFFlagSet
            )
            .unwrap(),
            (Icmpv6Types::PacketTooBig, Icmpv6Code(0))
        );
    }

    #[test]
    fn test_admin_prohibited_codes() {
        assert_eq!(
            translate_type_and_code_6_to_4(
                Icmpv6Types::DestinationUnreachable,
                Icmpv6Code(1)
            )
            .unwrap()
            .1,
            IcmpCode(10)
        );
        assert_eq!(
            translate_type_and_code_4_to_6(IcmpTypes::DestinationUnreachable, IcmpCode(13))
                .unwrap()
                .1,
            Icmpv6Code(1)
        );
    }

    #[test]
    fn test_unsupported_types_are_rejected() {
        assert_eq!(
            translate_type_and_code_4_to_6(IcmpTypes::Timestamp, IcmpCode(0)),
            Err(Error::UnsupportedIcmpType(13))
        );
        assert_eq!(
            translate_type_and_code_6_to_4(Icmpv6Types::RouterSolicit, Icmpv6Code(0)),
            Err(Error::UnsupportedIcmpv6Type(133))
        );
    }

    #[test]
    fn test_pointer_tables() {
        assert_eq!(translate_pointer_4_to_6(9), Some(6));
        assert_eq!(translate_pointer_4_to_6(16), Some(24));
        assert_eq!(translate_pointer_4_to_6(6), None);
        assert_eq!(translate_pointer_6_to_4(6), Some(9));
        assert_eq!(translate_pointer_6_to_4(30), Some(16));
        assert_eq!(translate_pointer_6_to_4(40), None);
    }
}
