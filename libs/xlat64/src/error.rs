//! Error types for this library

/// All possible errors thrown by `xlat64` functions.
///
/// The last three are not failures so much as instructions to the caller:
/// the pipeline answers them with the matching ICMP error and drops the
/// packet.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum Error {
    #[error("Packet too short. Expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },
    #[error("Unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),
    #[error("Unsupported ICMP type: {0}")]
    UnsupportedIcmpType(u8),
    #[error("Unsupported ICMPv6 type: {0}")]
    UnsupportedIcmpv6Type(u8),
    #[error("ICMP error may not quote another ICMP error")]
    IcmpErrorInIcmpError,
    #[error("Fragmented ICMP cannot be translated without reassembly")]
    FragmentedIcmp,
    #[error("Cannot translate a fragmented UDP datagram without a checksum")]
    MissingUdpChecksum,
    #[error("Hop limit would reach zero")]
    HopLimitExceeded,
    #[error("Packet does not fit the IPv6 MTU and has DF set (suggested MTU {mtu})")]
    FragmentationNeeded { mtu: u16 },
}

/// Result type for `xlat64`
pub type Result<T> = std::result::Result<T, Error>;
