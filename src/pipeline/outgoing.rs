//! Stage three: derive the translated packet's addressing from the session.
//!
//! An IPv6-side packet leaves as `pair4.local -> pair4.remote` (the
//! translator masquerades the IPv6 node); an IPv4-side packet leaves as
//! `pair6.local -> pair6.remote` (the IPv4 node appears under its pool6
//! embedding).

use std::net::{SocketAddrV4, SocketAddrV6};

use stateful_nat::Session;

/// The IPv4 source and destination for a translated IPv6-side packet
#[must_use]
pub fn outgoing_4(session: &Session) -> (SocketAddrV4, SocketAddrV4) {
    (
        SocketAddrV4::new(session.pair4.local.addr, session.pair4.local.id),
        SocketAddrV4::new(session.pair4.remote.addr, session.pair4.remote.id),
    )
}

/// The IPv6 source and destination for a translated IPv4-side packet
#[must_use]
pub fn outgoing_6(session: &Session) -> (SocketAddrV6, SocketAddrV6) {
    (
        SocketAddrV6::new(session.pair6.local.addr, session.pair6.local.id, 0, 0),
        SocketAddrV6::new(session.pair6.remote.addr, session.pair6.remote.id, 0, 0),
    )
}
