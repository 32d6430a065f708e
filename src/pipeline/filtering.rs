//! Stage two: decide what may pass, and keep the BIB and session tables in
//! step with what does.
//!
//! This stage owns the RFC6146 TCP state machine and the policy knobs
//! (address-dependent filtering, refusing external TCP, dropping ICMPv6
//! queries). Lock discipline: the BIB mutex is taken before the session
//! mutex; the pool and packet-queue mutexes only ever nest inside the BIB
//! lock or stand alone.

use std::time::Instant;

use pnet_packet::icmp::{IcmpCode, IcmpType, IcmpTypes};
use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Type, Icmpv6Types};
use pnet_packet::tcp::TcpFlags;

use stateful_nat::{Bib, BibId, ExpireList, L4Proto, Session, SessionTable, TcpState, Tuple4, Tuple6};

use super::incoming::{AnyTuple, ExtractedTuple, IncomingPacket};
use super::Nat64;

/// An ICMP error the pipeline should answer a dropped packet with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpReply {
    V4(IcmpType, IcmpCode),
    V6(Icmpv6Type, Icmpv6Code),
}

/// What filtering decided
#[derive(Debug, Clone)]
pub enum FilterVerdict {
    /// A session applies; translate using its pairs
    Translate(Session),
    /// Discard, optionally answering with an ICMP error
    Drop(Option<IcmpReply>),
    /// The packet now lives in the pending-SYN queue
    Stolen,
}

/// Communication administratively prohibited, the answer to IPv4 packets
/// no binding invites in
const PROHIBITED: IcmpReply = IcmpReply::V4(IcmpTypes::DestinationUnreachable, IcmpCode(13));
/// Address unreachable, the answer when the pool cannot mask a new flow
const NO_RESOURCES: IcmpReply =
    IcmpReply::V6(Icmpv6Types::DestinationUnreachable, Icmpv6Code(3));

/// Run stage two for one packet
pub fn filter(
    core: &Nat64,
    packet: &IncomingPacket,
    extracted: &ExtractedTuple,
    raw: &[u8],
    now: Instant,
) -> FilterVerdict {
    match (&extracted.tuple, packet) {
        (AnyTuple::V6(tuple), IncomingPacket::V6(packet)) => {
            filter6(core, packet, tuple, extracted.from_icmp_error, now)
        }
        (AnyTuple::V4(tuple), IncomingPacket::V4(packet)) => {
            filter4(core, packet, tuple, extracted.from_icmp_error, raw, now)
        }
        _ => FilterVerdict::Drop(None),
    }
}

fn filter6(
    core: &Nat64,
    packet: &xlat64::protocols::Ipv6Packet,
    tuple: &Tuple6,
    from_icmp_error: bool,
    now: Instant,
) -> FilterVerdict {
    let config = core.config.load();

    if config.filtering.drop_icmp6_info
        && tuple.l4 == L4Proto::Icmp
        && tuple.has_ids
        && !from_icmp_error
    {
        log::debug!("Dropping ICMPv6 query by policy");
        return FilterVerdict::Drop(None);
    }

    // ICMP errors and non-initial fragments may ride existing state only
    if from_icmp_error || !tuple.has_ids {
        let mut sessions = core.sessions(tuple.l4).lock().unwrap();
        return match sessions.get_by_tuple6(tuple) {
            Some((id, session)) => {
                let session = session.clone();
                if !from_icmp_error {
                    sessions.touch(id, session.list, now);
                }
                FilterVerdict::Translate(session)
            }
            None => FilterVerdict::Drop(None),
        };
    }

    match tuple.l4 {
        L4Proto::Udp | L4Proto::Icmp => filter6_data(core, tuple, now),
        L4Proto::Tcp => filter6_tcp(core, packet, tuple, now),
    }
}

/// IPv6-initiated UDP and ICMP: bindings and sessions appear on demand
fn filter6_data(core: &Nat64, tuple: &Tuple6, now: Instant) -> FilterVerdict {
    let pool6 = core.pool6.lock().unwrap().clone();
    let mut bib = core.bib(tuple.l4).lock().unwrap();

    let (bib_id, entry, bib_is_new) = match bib.get_by_6(tuple.src) {
        Some((id, entry)) => (id, entry.clone(), false),
        None => match mask_source(core, &mut bib, tuple) {
            Ok((id, entry)) => (id, entry, true),
            Err(verdict) => return verdict,
        },
    };

    let mut sessions = core.sessions(tuple.l4).lock().unwrap();
    match sessions.get_or_create_6(tuple, bib_id, &entry, &pool6, now) {
        Ok((id, created)) => {
            if created {
                bib.inc_sessions(bib_id);
                core.wake_expirer();
            } else {
                let list = sessions.get(id).unwrap().list;
                sessions.touch(id, list, now);
            }
            FilterVerdict::Translate(sessions.get(id).unwrap().clone())
        }
        Err(error) => {
            log::debug!("Cannot create session for {}: {}", tuple.src, error);
            if bib_is_new {
                drop_unused_binding(core, &mut bib, bib_id, tuple.l4);
            }
            FilterVerdict::Drop(None)
        }
    }
}

fn filter6_tcp(
    core: &Nat64,
    packet: &xlat64::protocols::Ipv6Packet,
    tuple: &Tuple6,
    now: Instant,
) -> FilterVerdict {
    let Some(flags) = tcp_flags(&packet.payload) else {
        return FilterVerdict::Drop(None);
    };

    let pool6 = core.pool6.lock().unwrap().clone();
    let mut bib = core.bib(L4Proto::Tcp).lock().unwrap();
    let mut sessions = core.sessions(L4Proto::Tcp).lock().unwrap();

    if let Some((id, session)) = sessions.get_by_tuple6(tuple) {
        let state = session.state;
        apply_v6_transition(core, &mut sessions, id, state, flags, now);
        return FilterVerdict::Translate(sessions.get(id).unwrap().clone());
    }

    // Only a SYN may open state; anything else concerns a flow this
    // translator no longer knows
    if flags & TcpFlags::SYN == 0 {
        log::debug!("Dropping stray IPv6 TCP packet for {}", tuple.dst);
        return FilterVerdict::Drop(None);
    }

    let (bib_id, entry, bib_is_new) = match bib.get_by_6(tuple.src) {
        Some((id, entry)) => (id, entry.clone(), false),
        None => match mask_source(core, &mut bib, tuple) {
            Ok((id, entry)) => (id, entry, true),
            Err(verdict) => return verdict,
        },
    };

    match sessions.get_or_create_6(tuple, bib_id, &entry, &pool6, now) {
        Ok((id, created)) => {
            if created {
                bib.inc_sessions(bib_id);
                core.wake_expirer();
            }
            FilterVerdict::Translate(sessions.get(id).unwrap().clone())
        }
        Err(error) => {
            log::debug!("Cannot create TCP session for {}: {}", tuple.src, error);
            if bib_is_new {
                drop_unused_binding(core, &mut bib, bib_id, L4Proto::Tcp);
            }
            FilterVerdict::Drop(None)
        }
    }
}

fn filter4(
    core: &Nat64,
    packet: &xlat64::protocols::Ipv4Packet,
    tuple: &Tuple4,
    from_icmp_error: bool,
    raw: &[u8],
    now: Instant,
) -> FilterVerdict {
    let config = core.config.load();

    if from_icmp_error || !tuple.has_ids {
        let mut sessions = core.sessions(tuple.l4).lock().unwrap();
        return match sessions.get_by_tuple4(tuple) {
            Some((id, session)) => {
                let session = session.clone();
                if !from_icmp_error {
                    sessions.touch(id, session.list, now);
                }
                FilterVerdict::Translate(session)
            }
            None => FilterVerdict::Drop(None),
        };
    }

    match tuple.l4 {
        L4Proto::Udp | L4Proto::Icmp => filter4_data(core, tuple, config.filtering.drop_by_addr, now),
        L4Proto::Tcp => filter4_tcp(
            core,
            packet,
            tuple,
            raw,
            config.filtering.drop_by_addr,
            config.filtering.drop_external_tcp,
            now,
        ),
    }
}

/// IPv4-initiated UDP and ICMP: only existing bindings let packets in
fn filter4_data(core: &Nat64, tuple: &Tuple4, drop_by_addr: bool, now: Instant) -> FilterVerdict {
    let pool6 = core.pool6.lock().unwrap().clone();
    let mut bib = core.bib(tuple.l4).lock().unwrap();

    let Some((bib_id, entry)) = bib.get_by_4(tuple.dst) else {
        return FilterVerdict::Drop(Some(PROHIBITED));
    };
    let entry = entry.clone();

    let mut sessions = core.sessions(tuple.l4).lock().unwrap();
    if drop_by_addr && sessions.get_by_tuple4(tuple).is_none() && !sessions.allow(tuple) {
        log::debug!("Address-dependent filtering rejected {}", tuple.src);
        return FilterVerdict::Drop(Some(PROHIBITED));
    }

    match sessions.get_or_create_4(tuple, bib_id, &entry, &pool6, now) {
        Ok((id, created)) => {
            if created {
                bib.inc_sessions(bib_id);
                core.wake_expirer();
            } else {
                let list = sessions.get(id).unwrap().list;
                sessions.touch(id, list, now);
            }
            FilterVerdict::Translate(sessions.get(id).unwrap().clone())
        }
        Err(error) => {
            log::debug!("Cannot create session for {}: {}", tuple.src, error);
            FilterVerdict::Drop(None)
        }
    }
}

fn filter4_tcp(
    core: &Nat64,
    packet: &xlat64::protocols::Ipv4Packet,
    tuple: &Tuple4,
    raw: &[u8],
    drop_by_addr: bool,
    drop_external_tcp: bool,
    now: Instant,
) -> FilterVerdict {
    let Some(flags) = tcp_flags(&packet.payload) else {
        return FilterVerdict::Drop(None);
    };

    let pool6 = core.pool6.lock().unwrap().clone();
    let mut bib = core.bib(L4Proto::Tcp).lock().unwrap();
    let mut sessions = core.sessions(L4Proto::Tcp).lock().unwrap();

    if let Some((id, session)) = sessions.get_by_tuple4(tuple) {
        // A retransmitted SYN replaces the one already waiting for the
        // simultaneous open to complete
        if session.state == TcpState::V4Init && flags & TcpFlags::SYN != 0 {
            core.pktqueue.lock().unwrap().add(id, raw.to_vec());
            return FilterVerdict::Stolen;
        }
        let state = session.state;
        apply_v4_transition(&mut sessions, id, state, flags, now);
        return FilterVerdict::Translate(sessions.get(id).unwrap().clone());
    }

    if flags & TcpFlags::SYN == 0 {
        // Quietly ignore stray segments; answering would leak state
        log::debug!("Dropping stray IPv4 TCP packet for {}", tuple.dst);
        return FilterVerdict::Drop(None);
    }

    if drop_external_tcp {
        return FilterVerdict::Drop(Some(PROHIBITED));
    }

    let Some((bib_id, entry)) = bib.get_by_4(tuple.dst) else {
        return FilterVerdict::Drop(Some(PROHIBITED));
    };
    let entry = entry.clone();

    if drop_by_addr && !sessions.allow(tuple) {
        return FilterVerdict::Drop(Some(PROHIBITED));
    }

    // The SYN might be one half of a simultaneous open, so it waits in the
    // queue for an IPv6 SYN instead of being answered or forwarded
    match sessions.get_or_create_4(tuple, bib_id, &entry, &pool6, now) {
        Ok((id, _)) => {
            bib.inc_sessions(bib_id);
            core.wake_expirer();
            core.pktqueue.lock().unwrap().add(id, raw.to_vec());
            FilterVerdict::Stolen
        }
        Err(error) => {
            log::debug!("Cannot create V4 INIT session: {}", error);
            FilterVerdict::Drop(None)
        }
    }
}

/// Allocate a pool transport address for a new IPv6 source and bind it
fn mask_source(
    core: &Nat64,
    bib: &mut Bib,
    tuple: &Tuple6,
) -> Result<(BibId, stateful_nat::BibEntry), FilterVerdict> {
    let transport = match core
        .pool4
        .lock()
        .unwrap()
        .get_any_port(tuple.l4, tuple.src.id)
    {
        Ok(transport) => transport,
        Err(error) => {
            log::debug!("Cannot mask {}: {}", tuple.src, error);
            return Err(FilterVerdict::Drop(Some(NO_RESOURCES)));
        }
    };
    match bib.add(tuple.src, transport, false) {
        Ok(id) => Ok((id, bib.get(id).unwrap().clone())),
        Err(error) => {
            log::debug!("Cannot bind {}: {}", tuple.src, error);
            core.pool4
                .lock()
                .unwrap()
                .release(transport.addr, transport.id, tuple.l4);
            Err(FilterVerdict::Drop(None))
        }
    }
}

/// Undo a binding created moments ago whose session never materialized
fn drop_unused_binding(core: &Nat64, bib: &mut Bib, id: BibId, l4: L4Proto) {
    if let Ok(entry) = bib.remove(id) {
        core.pool4
            .lock()
            .unwrap()
            .release(entry.addr4.addr, entry.addr4.id, l4);
    }
}

/// The flags byte sits at a fixed offset; no need to parse the whole
/// segment twice
fn tcp_flags(segment: &[u8]) -> Option<u8> {
    segment.get(13).copied()
}

/// RFC6146 section 3.5.2 state machine, IPv6-side packet
fn apply_v6_transition(
    core: &Nat64,
    sessions: &mut SessionTable,
    id: stateful_nat::SessionId,
    state: TcpState,
    flags: u8,
    now: Instant,
) {
    let syn = flags & TcpFlags::SYN != 0;
    let fin = flags & TcpFlags::FIN != 0;
    let rst = flags & TcpFlags::RST != 0;

    match state {
        // The simultaneous open completed; the parked IPv4 SYN is obsolete
        TcpState::V4Init if syn => {
            sessions.set_state(id, TcpState::Established);
            sessions.touch(id, ExpireList::TcpEst, now);
            core.pktqueue.lock().unwrap().remove(id);
        }
        TcpState::Established => {
            if rst {
                sessions.set_state(id, TcpState::Trans);
                sessions.touch(id, ExpireList::TcpTrans, now);
            } else if fin {
                sessions.set_state(id, TcpState::V6FinRcv);
            } else {
                sessions.touch(id, ExpireList::TcpEst, now);
            }
        }
        TcpState::V4FinRcv if fin => {
            sessions.set_state(id, TcpState::V4FinV6FinRcv);
            sessions.touch(id, ExpireList::TcpTrans, now);
        }
        // Traffic on a probed session proves it alive again
        TcpState::Trans if !rst => {
            sessions.set_state(id, TcpState::Established);
            sessions.touch(id, ExpireList::TcpEst, now);
        }
        _ => {}
    }
}

/// RFC6146 section 3.5.2 state machine, IPv4-side packet
fn apply_v4_transition(
    sessions: &mut SessionTable,
    id: stateful_nat::SessionId,
    state: TcpState,
    flags: u8,
    now: Instant,
) {
    let syn = flags & TcpFlags::SYN != 0;
    let fin = flags & TcpFlags::FIN != 0;
    let rst = flags & TcpFlags::RST != 0;

    match state {
        TcpState::V6Init if syn => {
            sessions.set_state(id, TcpState::Established);
            sessions.touch(id, ExpireList::TcpEst, now);
        }
        TcpState::Established => {
            if rst {
                sessions.set_state(id, TcpState::Trans);
                sessions.touch(id, ExpireList::TcpTrans, now);
            } else if fin {
                sessions.set_state(id, TcpState::V4FinRcv);
            } else {
                sessions.touch(id, ExpireList::TcpEst, now);
            }
        }
        TcpState::V6FinRcv if fin => {
            sessions.set_state(id, TcpState::V4FinV6FinRcv);
            sessions.touch(id, ExpireList::TcpTrans, now);
        }
        TcpState::Trans if !rst => {
            sessions.set_state(id, TcpState::Established);
            sessions.touch(id, ExpireList::TcpEst, now);
        }
        _ => {}
    }
}
