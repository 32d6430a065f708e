//! The IPv4 transport-address pool.
//!
//! Every pool address carries one 65536-bit port bitmap per transport
//! protocol. Allocation follows the RFC6146 port preservation rules: a
//! translated source port keeps the parity and the range class (system
//! ports below 1024, user ports above) of the original IPv6 source port,
//! and the exact same port is preferred when it is free anywhere in the
//! pool.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::tuple::{L4Proto, Transport4};

/// Bitmask selecting even bit positions within a word
const EVEN_PORTS: u64 = 0x5555_5555_5555_5555;
/// Bitmask selecting odd bit positions within a word
const ODD_PORTS: u64 = !EVEN_PORTS;

/// A 65536-bit occupancy map over one address's ports for one protocol
#[derive(Debug, Clone)]
struct PortBitmap {
    words: Box<[u64; 1024]>,
    used: u32,
}

impl PortBitmap {
    fn new() -> Self {
        Self {
            words: Box::new([0u64; 1024]),
            used: 0,
        }
    }

    fn test(&self, port: u16) -> bool {
        self.words[usize::from(port / 64)] & (1 << (port % 64)) != 0
    }

    fn set(&mut self, port: u16) {
        self.words[usize::from(port / 64)] |= 1 << (port % 64);
        self.used += 1;
    }

    fn clear(&mut self, port: u16) {
        let word = &mut self.words[usize::from(port / 64)];
        if *word & (1 << (port % 64)) != 0 {
            *word &= !(1 << (port % 64));
            self.used -= 1;
        }
    }

    /// Find the lowest free port in `start..=end` whose bit survives
    /// `parity_mask`, scanning a word at a time
    fn find_free(&self, start: u16, end: u16, parity_mask: u64) -> Option<u16> {
        let first_word = usize::from(start / 64);
        let last_word = usize::from(end / 64);
        for index in first_word..=last_word {
            let mut candidates = !self.words[index] & parity_mask;
            if index == first_word {
                candidates &= !0u64 << (start % 64);
            }
            if index == last_word && end % 64 != 63 {
                candidates &= (1u64 << (end % 64 + 1)) - 1;
            }
            if candidates != 0 {
                #[allow(clippy::cast_possible_truncation)]
                return Some((index as u16) * 64 + candidates.trailing_zeros() as u16);
            }
        }
        None
    }
}

/// One pool member: an address and its three per-protocol bitmaps
#[derive(Debug, Clone)]
struct PoolAddress {
    addr: Ipv4Addr,
    ports: [PortBitmap; 3],
}

impl PoolAddress {
    fn new(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            ports: std::array::from_fn(|_| PortBitmap::new()),
        }
    }
}

/// The set of IPv4 addresses the translator masquerades behind
#[derive(Debug, Clone, Default)]
pub struct Pool4 {
    addresses: Vec<PoolAddress>,
    /// Where the next allocation scan starts, for round-robin fairness
    cursor: usize,
}

/// The range class a port belongs to ("system" below 1024, "user" above)
fn class_bounds(port: u16) -> (u16, u16) {
    if port < 1024 {
        (0, 1023)
    } else {
        (1024, u16::MAX)
    }
}

fn parity_mask(port: u16) -> u64 {
    if port % 2 == 0 {
        EVEN_PORTS
    } else {
        ODD_PORTS
    }
}

impl Pool4 {
    /// Construct a new empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, addr: Ipv4Addr) -> Option<usize> {
        self.addresses.iter().position(|entry| entry.addr == addr)
    }

    /// Check whether an address belongs to the pool
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.position(addr).is_some()
    }

    /// Add a single address to the pool
    pub fn add(&mut self, addr: Ipv4Addr) -> Result<()> {
        if self.contains(addr) {
            return Err(Error::AddressAlreadyInPool(addr));
        }
        log::info!("Added {} to the IPv4 pool", addr);
        self.addresses.push(PoolAddress::new(addr));
        Ok(())
    }

    /// Add every host address of a prefix to the pool
    pub fn add_net(&mut self, net: Ipv4Net) -> Result<()> {
        for addr in net.hosts() {
            self.add(addr)?;
        }
        Ok(())
    }

    /// Remove an address from the pool, abandoning its reservations.
    ///
    /// The caller is responsible for cascading the removal through the BIB
    /// and session tables.
    pub fn remove(&mut self, addr: Ipv4Addr) -> Result<()> {
        let position = self.position(addr).ok_or(Error::AddressNotInPool(addr))?;
        self.addresses.remove(position);
        if self.cursor >= self.addresses.len() {
            self.cursor = 0;
        }
        log::info!("Removed {} from the IPv4 pool", addr);
        Ok(())
    }

    /// Drop every address in the pool
    pub fn flush(&mut self) {
        self.addresses.clear();
        self.cursor = 0;
    }

    /// Allocate a transport address for a flow whose IPv6 source port is
    /// `src_port`, following the RFC6146 preservation rules
    pub fn get_any_port(&mut self, l4: L4Proto, src_port: u16) -> Result<Transport4> {
        if self.addresses.is_empty() {
            return Err(Error::PoolExhausted);
        }
        let count = self.addresses.len();
        let start = self.cursor;
        let order = (0..count).map(move |step| (start + step) % count);

        // The exact same port wins if any pool address still has it
        for index in order.clone() {
            let entry = &mut self.addresses[index];
            if !entry.ports[l4.index()].test(src_port) {
                entry.ports[l4.index()].set(src_port);
                self.cursor = index;
                return Ok(Transport4::new(entry.addr, src_port));
            }
        }

        // Next best: any port of the same parity and range class
        let (class_start, class_end) = class_bounds(src_port);
        let scan_start = class_start.max(1);
        for index in order.clone() {
            let entry = &mut self.addresses[index];
            if let Some(port) =
                entry.ports[l4.index()].find_free(scan_start, class_end, parity_mask(src_port))
            {
                entry.ports[l4.index()].set(port);
                self.cursor = index;
                return Ok(Transport4::new(entry.addr, port));
            }
        }

        // Preservation failed entirely; take anything that is left
        for index in order {
            let entry = &mut self.addresses[index];
            if let Some(port) = entry.ports[l4.index()].find_free(1, u16::MAX, !0u64) {
                entry.ports[l4.index()].set(port);
                self.cursor = index;
                return Ok(Transport4::new(entry.addr, port));
            }
        }

        Err(Error::PoolExhausted)
    }

    /// Reserve a specific transport address (static bindings)
    pub fn reserve(&mut self, addr: Ipv4Addr, port: u16, l4: L4Proto) -> Result<()> {
        let position = self.position(addr).ok_or(Error::AddressNotInPool(addr))?;
        let bitmap = &mut self.addresses[position].ports[l4.index()];
        if bitmap.test(port) {
            return Err(Error::PortTaken(addr, port));
        }
        bitmap.set(port);
        Ok(())
    }

    /// Return a transport address to the pool
    pub fn release(&mut self, addr: Ipv4Addr, port: u16, l4: L4Proto) {
        if let Some(position) = self.position(addr) {
            self.addresses[position].ports[l4.index()].clear(port);
        }
    }

    /// Iterate the pool's addresses in order
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.addresses.iter().map(|entry| entry.addr)
    }

    /// Get the number of addresses in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Check if the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Count the ports currently reserved for one protocol
    #[must_use]
    pub fn used_ports(&self, l4: L4Proto) -> usize {
        self.addresses
            .iter()
            .map(|entry| entry.ports[l4.index()].used as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(addrs: &[&str]) -> Pool4 {
        let mut pool = Pool4::new();
        for addr in addrs {
            pool.add(addr.parse().unwrap()).unwrap();
        }
        pool
    }

    #[test]
    fn test_same_port_preferred() {
        let mut pool = pool_with(&["192.0.2.1"]);
        let got = pool.get_any_port(L4Proto::Udp, 4000).unwrap();
        assert_eq!(got, Transport4::new("192.0.2.1".parse().unwrap(), 4000));
    }

    #[test]
    fn test_same_port_found_on_second_address() {
        let mut pool = pool_with(&["192.0.2.1", "192.0.2.2"]);
        pool.reserve("192.0.2.1".parse().unwrap(), 4000, L4Proto::Udp)
            .unwrap();
        let got = pool.get_any_port(L4Proto::Udp, 4000).unwrap();
        assert_eq!(got, Transport4::new("192.0.2.2".parse().unwrap(), 4000));
    }

    #[test]
    fn test_parity_and_range_preserved() {
        let mut pool = pool_with(&["192.0.2.1"]);
        pool.reserve("192.0.2.1".parse().unwrap(), 4001, L4Proto::Tcp)
            .unwrap();
        let got = pool.get_any_port(L4Proto::Tcp, 4001).unwrap();
        assert_eq!(got.id % 2, 1, "parity must match the source port");
        assert!(got.id >= 1024, "user-range source ports stay in range");

        // System-range requests stay below 1024
        let got = pool.get_any_port(L4Proto::Tcp, 80).unwrap();
        assert_eq!(got.id, 80);
        let got = pool.get_any_port(L4Proto::Tcp, 80).unwrap();
        assert!(got.id < 1024);
        assert_eq!(got.id % 2, 0);
    }

    #[test]
    fn test_falls_back_to_other_class() {
        let mut pool = pool_with(&["192.0.2.1"]);
        // Exhaust the whole system range
        for port in 0..1024 {
            pool.reserve("192.0.2.1".parse().unwrap(), port, L4Proto::Udp)
                .unwrap();
        }
        let got = pool.get_any_port(L4Proto::Udp, 80).unwrap();
        assert!(got.id >= 1024);
    }

    #[test]
    fn test_protocols_do_not_collide() {
        let mut pool = pool_with(&["192.0.2.1"]);
        pool.reserve("192.0.2.1".parse().unwrap(), 4000, L4Proto::Udp)
            .unwrap();
        // The TCP bitmap is independent, so the same port is still free
        let got = pool.get_any_port(L4Proto::Tcp, 4000).unwrap();
        assert_eq!(got.id, 4000);
    }

    #[test]
    fn test_release_makes_port_reusable() {
        let mut pool = pool_with(&["192.0.2.1"]);
        pool.reserve("192.0.2.1".parse().unwrap(), 4000, L4Proto::Udp)
            .unwrap();
        pool.release("192.0.2.1".parse().unwrap(), 4000, L4Proto::Udp);
        let got = pool.get_any_port(L4Proto::Udp, 4000).unwrap();
        assert_eq!(got.id, 4000);
        assert_eq!(pool.used_ports(L4Proto::Udp), 1);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = Pool4::new();
        assert_eq!(
            pool.get_any_port(L4Proto::Udp, 4000),
            Err(Error::PoolExhausted)
        );
    }

    #[test]
    fn test_add_net_expands_hosts() {
        let mut pool = Pool4::new();
        pool.add_net("192.0.2.0/30".parse().unwrap()).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.contains("192.0.2.1".parse().unwrap()));
        assert!(pool.contains("192.0.2.2".parse().unwrap()));
    }
}
