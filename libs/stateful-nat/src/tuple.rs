//! The canonical flow representation handed between pipeline stages.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// The transport protocols the translator keeps state for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum L4Proto {
    Udp,
    Tcp,
    Icmp,
}

impl L4Proto {
    /// All protocols, in the order the per-protocol tables are laid out
    pub const ALL: [L4Proto; 3] = [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp];

    /// Index into per-protocol arrays
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            L4Proto::Udp => 0,
            L4Proto::Tcp => 1,
            L4Proto::Icmp => 2,
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Proto::Udp => write!(f, "UDP"),
            L4Proto::Tcp => write!(f, "TCP"),
            L4Proto::Icmp => write!(f, "ICMP"),
        }
    }
}

/// An IPv6 transport address: address plus port (or ICMP identifier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Transport6 {
    pub addr: Ipv6Addr,
    pub id: u16,
}

impl Transport6 {
    #[must_use]
    pub fn new(addr: Ipv6Addr, id: u16) -> Self {
        Self { addr, id }
    }
}

impl fmt::Display for Transport6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.id)
    }
}

/// An IPv4 transport address: address plus port (or ICMP identifier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Transport4 {
    pub addr: Ipv4Addr,
    pub id: u16,
}

impl Transport4 {
    #[must_use]
    pub fn new(addr: Ipv4Addr, id: u16) -> Self {
        Self { addr, id }
    }

    /// Smallest possible transport address, used as a range bound
    #[must_use]
    pub fn min() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, 0)
    }

    /// Largest possible transport address, used as a range bound
    #[must_use]
    pub fn max() -> Self {
        Self::new(Ipv4Addr::BROADCAST, u16::MAX)
    }
}

impl fmt::Display for Transport4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.id)
    }
}

/// A flow's 5-tuple (3-tuple for ICMP, where both ids hold the identifier).
///
/// Non-initial fragments carry no transport header, so their tuples have
/// zeroed ids and `has_ids == false`; they are matched against sessions by
/// address pair alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple<A> {
    pub src: A,
    pub dst: A,
    pub l4: L4Proto,
    pub has_ids: bool,
}

/// An IPv4-side tuple
pub type Tuple4 = Tuple<Transport4>;
/// An IPv6-side tuple
pub type Tuple6 = Tuple<Transport6>;

impl<A> Tuple<A> {
    /// A tuple extracted from a packet with a visible transport header
    pub fn new(src: A, dst: A, l4: L4Proto) -> Self {
        Self {
            src,
            dst,
            l4,
            has_ids: true,
        }
    }

    /// A tuple for a non-initial fragment (addresses only)
    pub fn fragment(src: A, dst: A, l4: L4Proto) -> Self {
        Self {
            src,
            dst,
            l4,
            has_ids: false,
        }
    }
}
