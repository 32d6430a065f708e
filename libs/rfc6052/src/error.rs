//! Error types for this library

use ipnet::Ipv6Net;
use std::net::Ipv6Addr;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid IPv6 prefix length: {0}. Must be one of 32, 40, 48, 56, 64, or 96")]
    InvalidPrefixLength(u8),
    #[error("Address has data in the reserved octet: {0}")]
    InvalidAddress(Ipv6Addr),
    #[error("Prefix already exists in the pool: {0}")]
    DuplicatePrefix(Ipv6Net),
    #[error("Prefix does not exist in the pool: {0}")]
    UnknownPrefix(Ipv6Net),
}

/// Result type for this library
pub type Result<T> = std::result::Result<T, Error>;
