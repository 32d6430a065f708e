//! The IPv6 translation-prefix pool ("pool6").
//!
//! The pool decides which incoming IPv6 destinations belong to the
//! translator, and which prefix to use when synthesizing IPv6 addresses for
//! IPv4 nodes. Order matters: the first prefix added is the one used for
//! synthesis.

use ipnet::Ipv6Net;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::addr::{addr_4to6, addr_6to4};
use crate::error::{Error, Result};
use crate::ALLOWED_PREFIX_LENS;

/// An ordered set of RFC6052 translation prefixes
#[derive(Debug, Clone, Default)]
pub struct Pool6 {
    prefixes: Vec<Ipv6Net>,
}

impl Pool6 {
    /// Construct a new empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prefix to the pool, keeping insertion order
    pub fn add(&mut self, prefix: Ipv6Net) -> Result<()> {
        if !ALLOWED_PREFIX_LENS.contains(&prefix.prefix_len()) {
            return Err(Error::InvalidPrefixLength(prefix.prefix_len()));
        }
        let prefix = prefix.trunc();
        if self.prefixes.contains(&prefix) {
            return Err(Error::DuplicatePrefix(prefix));
        }
        log::info!("Added translation prefix {}", prefix);
        self.prefixes.push(prefix);
        Ok(())
    }

    /// Remove a prefix from the pool
    pub fn remove(&mut self, prefix: &Ipv6Net) -> Result<()> {
        let prefix = prefix.trunc();
        let before = self.prefixes.len();
        self.prefixes.retain(|existing| *existing != prefix);
        if self.prefixes.len() == before {
            return Err(Error::UnknownPrefix(prefix));
        }
        log::info!("Removed translation prefix {}", prefix);
        Ok(())
    }

    /// Drop every prefix in the pool
    pub fn flush(&mut self) {
        self.prefixes.clear();
    }

    /// Find the prefix that covers an IPv6 address, if any.
    ///
    /// This is the "does this destination belong to us" check of the
    /// incoming pipeline.
    #[must_use]
    pub fn match_prefix(&self, addr: &Ipv6Addr) -> Option<Ipv6Net> {
        self.prefixes
            .iter()
            .find(|prefix| prefix.contains(addr))
            .copied()
    }

    /// Check whether an IPv6 address falls inside any pool prefix
    #[must_use]
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.match_prefix(addr).is_some()
    }

    /// Extract the IPv4 address embedded in `addr` using whichever pool
    /// prefix covers it
    pub fn extract(&self, addr: Ipv6Addr) -> Option<Result<Ipv4Addr>> {
        self.match_prefix(&addr)
            .map(|prefix| addr_6to4(addr, prefix))
    }

    /// Synthesize the IPv6 representation of an IPv4 node using the pool's
    /// preferred (first) prefix
    pub fn synthesize(&self, addr: Ipv4Addr) -> Option<Result<Ipv6Addr>> {
        self.prefixes.first().map(|prefix| addr_4to6(addr, *prefix))
    }

    /// Iterate the pool's prefixes in order
    pub fn iter(&self) -> impl Iterator<Item = &Ipv6Net> {
        self.prefixes.iter()
    }

    /// Get the number of prefixes in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Check if the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}
