//! Error types for this library

use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("IPv4 transport pool exhausted")]
    PoolExhausted,
    #[error("Address does not belong to the pool: {0}")]
    AddressNotInPool(Ipv4Addr),
    #[error("Address already exists in the pool: {0}")]
    AddressAlreadyInPool(Ipv4Addr),
    #[error("Transport address {0}:{1} is already reserved")]
    PortTaken(Ipv4Addr, u16),
    #[error("A BIB entry already maps one side of this binding")]
    DuplicateBib,
    #[error("No such BIB entry")]
    BibNotFound,
    #[error("A session already exists for this flow")]
    DuplicateSession,
    #[error("No translation prefix applies to this flow")]
    NoPool6Prefix,
    #[error(transparent)]
    Rfc6052(#[from] rfc6052::error::Error),
}

/// Result type for this library
pub type Result<T> = std::result::Result<T, Error>;
