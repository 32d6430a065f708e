//! The per-flow session tables.
//!
//! A session records one translated flow: the IPv6-side address pair, the
//! IPv4-side address pair, the TCP state machine position, and which expiry
//! list currently holds it. Each protocol's table indexes its sessions by
//! both pairs with ordered trees; the two trees plus the expiry queues all
//! point at the same record, keyed by an internal id.
//!
//! Pair labelling: `local` is the transport address the translator itself
//! owns on that side (the pool6 embedding on the IPv6 side, the pool4
//! reservation on the IPv4 side) and `remote` is the end node. The BIB
//! entry behind a session therefore satisfies `bib.addr6 == pair6.remote`
//! and `bib.addr4 == pair4.local`.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::Bound;
use std::time::Instant;

use ipnet::Ipv6Net;
use rfc6052::Pool6;

use crate::bib::{BibEntry, BibId};
use crate::error::{Error, Result};
use crate::expirer::{ExpireEvent, ExpireList, ExpireQueues, Ttls};
use crate::tuple::{L4Proto, Transport4, Transport6, Tuple4, Tuple6};

/// Opaque handle to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

/// The RFC6146 TCP session states. `Closed` is never stored in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    V4Init,
    V6Init,
    Established,
    V4FinRcv,
    V6FinRcv,
    V4FinV6FinRcv,
    Trans,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::V4Init => "V4_INIT",
            TcpState::V6Init => "V6_INIT",
            TcpState::Established => "ESTABLISHED",
            TcpState::V4FinRcv => "V4_FIN_RCV",
            TcpState::V6FinRcv => "V6_FIN_RCV",
            TcpState::V4FinV6FinRcv => "V4_FIN_V6_FIN_RCV",
            TcpState::Trans => "TRANS",
        };
        write!(f, "{name}")
    }
}

/// The IPv6-side address pair of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair6 {
    pub remote: Transport6,
    pub local: Transport6,
}

/// The IPv4-side address pair of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair4 {
    pub local: Transport4,
    pub remote: Transport4,
}

/// One translated flow
#[derive(Debug, Clone)]
pub struct Session {
    pub pair6: Pair6,
    pub pair4: Pair4,
    pub l4: L4Proto,
    pub state: TcpState,
    pub update_time: Instant,
    pub list: ExpireList,
    pub bib: BibId,
}

/// A per-protocol session table
#[derive(Debug)]
pub struct SessionTable {
    l4: L4Proto,
    sessions: FxHashMap<u64, Session>,
    by6: BTreeMap<(Transport6, Transport6), u64>,
    by4: BTreeMap<(Transport4, Transport4), u64>,
    queues: ExpireQueues,
    next_id: u64,
}

impl SessionTable {
    /// Construct a new empty table for one protocol
    #[must_use]
    pub fn new(l4: L4Proto) -> Self {
        Self {
            l4,
            sessions: FxHashMap::default(),
            by6: BTreeMap::new(),
            by4: BTreeMap::new(),
            queues: ExpireQueues::default(),
            next_id: 0,
        }
    }

    fn key6(session: &Session) -> (Transport6, Transport6) {
        (session.pair6.remote, session.pair6.local)
    }

    fn key4(session: &Session) -> (Transport4, Transport4) {
        (session.pair4.local, session.pair4.remote)
    }

    /// Fetch a session by handle
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id.0)
    }

    /// Canonical lookup for an IPv6-side tuple
    #[must_use]
    pub fn get_by_tuple6(&self, tuple: &Tuple6) -> Option<(SessionId, &Session)> {
        if tuple.has_ids {
            let id = *self.by6.get(&(tuple.src, tuple.dst))?;
            Some((SessionId(id), &self.sessions[&id]))
        } else {
            self.find_by_addrs_6(tuple.src.addr, tuple.dst.addr)
        }
    }

    /// Canonical lookup for an IPv4-side tuple
    #[must_use]
    pub fn get_by_tuple4(&self, tuple: &Tuple4) -> Option<(SessionId, &Session)> {
        if tuple.has_ids {
            let id = *self.by4.get(&(tuple.dst, tuple.src))?;
            Some((SessionId(id), &self.sessions[&id]))
        } else {
            self.find_by_addrs_4(tuple.src.addr, tuple.dst.addr)
        }
    }

    /// Address-only match for non-initial fragments (remote6 == src,
    /// local6 == dst, any ids)
    fn find_by_addrs_6(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Option<(SessionId, &Session)> {
        let from = (Transport6::new(src, 0), Transport6::new(Ipv6Addr::UNSPECIFIED, 0));
        let to = (
            Transport6::new(src, u16::MAX),
            Transport6::new(Ipv6Addr::from(u128::MAX), u16::MAX),
        );
        self.by6
            .range(from..=to)
            .find(|((_, local), _)| local.addr == dst)
            .map(|(_, id)| (SessionId(*id), &self.sessions[id]))
    }

    /// Address-only match for non-initial fragments (local4 == dst,
    /// remote4 == src, any ids)
    fn find_by_addrs_4(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<(SessionId, &Session)> {
        let from = (Transport4::new(dst, 0), Transport4::min());
        let to = (Transport4::new(dst, u16::MAX), Transport4::max());
        self.by4
            .range(from..=to)
            .find(|((_, remote), _)| remote.addr == src)
            .map(|(_, id)| (SessionId(*id), &self.sessions[id]))
    }

    /// Address-dependent filtering check: does any session already talk to
    /// this IPv4 node from this local transport address? The remote port is
    /// deliberately ignored.
    #[must_use]
    pub fn allow(&self, tuple: &Tuple4) -> bool {
        let from = (tuple.dst, Transport4::new(tuple.src.addr, 0));
        let to = (tuple.dst, Transport4::new(tuple.src.addr, u16::MAX));
        self.by4.range(from..=to).next().is_some()
    }

    /// Insert a fully-formed session, rejecting duplicates on either index
    pub fn add(&mut self, session: Session) -> Result<SessionId> {
        let key6 = Self::key6(&session);
        let key4 = Self::key4(&session);
        if self.by6.contains_key(&key6) || self.by4.contains_key(&key4) {
            return Err(Error::DuplicateSession);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.queues.push(session.list, id, session.update_time);
        self.by6.insert(key6, id);
        self.by4.insert(key4, id);
        self.sessions.insert(id, session);
        Ok(SessionId(id))
    }

    /// Look up the session for an IPv6-side tuple, creating it against the
    /// given BIB entry on miss.
    ///
    /// New sessions start in the state the first IPv6 packet of a flow
    /// implies: plain data sessions for UDP/ICMP, `V6_INIT` on the
    /// transitory list for TCP.
    pub fn get_or_create_6(
        &mut self,
        tuple: &Tuple6,
        bib_id: BibId,
        bib: &BibEntry,
        pool6: &Pool6,
        now: Instant,
    ) -> Result<(SessionId, bool)> {
        if let Some((id, _)) = self.get_by_tuple6(tuple) {
            return Ok((id, false));
        }

        let remote4_addr = pool6.extract(tuple.dst.addr).ok_or(Error::NoPool6Prefix)??;
        let remote4_id = match self.l4 {
            // ICMP flows alias the translated identifier on the IPv4 side
            L4Proto::Icmp => bib.addr4.id,
            _ => tuple.dst.id,
        };

        let (state, list) = match self.l4 {
            L4Proto::Udp => (TcpState::Established, ExpireList::Udp),
            L4Proto::Icmp => (TcpState::Established, ExpireList::Icmp),
            L4Proto::Tcp => (TcpState::V6Init, ExpireList::TcpTrans),
        };

        let id = self.add(Session {
            pair6: Pair6 {
                remote: tuple.src,
                local: tuple.dst,
            },
            pair4: Pair4 {
                local: bib.addr4,
                remote: Transport4::new(remote4_addr, remote4_id),
            },
            l4: self.l4,
            state,
            update_time: now,
            list,
            bib: bib_id,
        })?;
        Ok((id, true))
    }

    /// Look up the session for an IPv4-side tuple, creating it against the
    /// given BIB entry on miss.
    ///
    /// New TCP sessions enter `V4_INIT` on the SYN backoff list; the caller
    /// is expected to park the packet in the pending-SYN queue.
    pub fn get_or_create_4(
        &mut self,
        tuple: &Tuple4,
        bib_id: BibId,
        bib: &BibEntry,
        pool6: &Pool6,
        now: Instant,
    ) -> Result<(SessionId, bool)> {
        if let Some((id, _)) = self.get_by_tuple4(tuple) {
            return Ok((id, false));
        }

        let local6_addr = pool6.synthesize(tuple.src.addr).ok_or(Error::NoPool6Prefix)??;
        let local6_id = match self.l4 {
            // ICMP flows keep the IPv6-side identifier on both halves of
            // the IPv6 pair
            L4Proto::Icmp => bib.addr6.id,
            _ => tuple.src.id,
        };

        let (state, list) = match self.l4 {
            L4Proto::Udp => (TcpState::Established, ExpireList::Udp),
            L4Proto::Icmp => (TcpState::Established, ExpireList::Icmp),
            L4Proto::Tcp => (TcpState::V4Init, ExpireList::Syn),
        };

        let id = self.add(Session {
            pair6: Pair6 {
                remote: bib.addr6,
                local: Transport6::new(local6_addr, local6_id),
            },
            pair4: Pair4 {
                local: tuple.dst,
                remote: tuple.src,
            },
            l4: self.l4,
            state,
            update_time: now,
            list,
            bib: bib_id,
        })?;
        Ok((id, true))
    }

    /// Change a session's TCP state
    pub fn set_state(&mut self, id: SessionId, state: TcpState) {
        if let Some(session) = self.sessions.get_mut(&id.0) {
            session.state = state;
        }
    }

    /// Refresh a session: stamp it, move it to (the tail of) the given
    /// expiry list
    pub fn touch(&mut self, id: SessionId, list: ExpireList, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&id.0) {
            session.update_time = now;
            session.list = list;
            self.queues.push(list, id.0, now);
        }
    }

    /// Remove a session from both indices
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id.0)?;
        self.by6.remove(&Self::key6(&session));
        self.by4.remove(&Self::key4(&session));
        Some(session)
    }

    /// Remove every session referencing a BIB entry
    pub fn delete_by_bib(&mut self, bib: BibId) -> Vec<(SessionId, Session)> {
        self.remove_where(|session| session.bib == bib)
    }

    /// Remove every session whose pool side uses an IPv4 address
    pub fn delete_by_v4(&mut self, addr: Ipv4Addr) -> Vec<(SessionId, Session)> {
        self.remove_where(|session| session.pair4.local.addr == addr)
    }

    /// Remove every session whose synthesized IPv6 side falls inside a
    /// translation prefix
    pub fn delete_by_v6_prefix(&mut self, prefix: &Ipv6Net) -> Vec<(SessionId, Session)> {
        self.remove_where(|session| prefix.contains(&session.pair6.local.addr))
    }

    /// Remove every session in the table
    pub fn flush(&mut self) -> Vec<(SessionId, Session)> {
        self.remove_where(|_| true)
    }

    fn remove_where<F: Fn(&Session) -> bool>(&mut self, predicate: F) -> Vec<(SessionId, Session)> {
        let doomed: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| predicate(session))
            .map(|(id, _)| *id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| {
                self.remove(SessionId(id))
                    .map(|session| (SessionId(id), session))
            })
            .collect()
    }

    /// Get the number of sessions in the table
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Iterate sessions ordered by their IPv4 pair, starting after `cursor`
    /// when one is given
    pub fn iter_from(
        &self,
        cursor: Option<(Transport4, Transport4)>,
    ) -> impl Iterator<Item = (SessionId, &Session)> {
        let start = match cursor {
            Some(pair) => Bound::Excluded(pair),
            None => Bound::Unbounded,
        };
        self.by4
            .range((start, Bound::Unbounded))
            .map(|(_, id)| (SessionId(*id), &self.sessions[id]))
    }

    /// Run the expiry walk over every list of this table.
    ///
    /// Each list is ordered by update time, so the walk stops at the first
    /// live entry. Returns the events the caller must act on and the
    /// earliest deadline any list still holds.
    pub fn expire(&mut self, now: Instant, ttls: &Ttls) -> (Vec<ExpireEvent>, Option<Instant>) {
        let mut events = Vec::new();
        for list in ExpireList::ALL {
            self.expire_list(list, now, ttls.for_list(list), &mut events);
        }
        (events, self.next_deadline(ttls))
    }

    fn expire_list(
        &mut self,
        list: ExpireList,
        now: Instant,
        ttl: std::time::Duration,
        events: &mut Vec<ExpireEvent>,
    ) {
        loop {
            let Some(&(id, stamp)) = self.queues.queue_mut(list).front() else {
                return;
            };

            // Entries whose stamp no longer matches the session were moved
            // or deleted after being queued; discard them
            let Some(session) = self.sessions.get(&id) else {
                self.queues.queue_mut(list).pop_front();
                continue;
            };
            if session.list != list || session.update_time != stamp {
                self.queues.queue_mut(list).pop_front();
                continue;
            }

            if stamp + ttl > now {
                return;
            }

            self.queues.queue_mut(list).pop_front();
            match list {
                ExpireList::Udp | ExpireList::Icmp | ExpireList::TcpTrans => {
                    if let Some(dead) = self.remove(SessionId(id)) {
                        events.push(ExpireEvent::Deleted {
                            id: SessionId(id),
                            session: dead,
                        });
                    }
                }
                ExpireList::Syn => {
                    if let Some(dead) = self.remove(SessionId(id)) {
                        events.push(ExpireEvent::SynTimeout {
                            id: SessionId(id),
                            session: dead,
                        });
                    }
                }
                ExpireList::TcpEst => {
                    // Quiet established sessions get probed rather than
                    // dropped; the answer (or lack of one) decides their
                    // fate on the transitory list
                    let pair6 = session.pair6;
                    self.set_state(SessionId(id), TcpState::Trans);
                    self.touch(SessionId(id), ExpireList::TcpTrans, now);
                    events.push(ExpireEvent::Probe {
                        id: SessionId(id),
                        pair6,
                    });
                }
            }
        }
    }

    /// Earliest deadline over all lists, discarding stale queue heads
    pub fn next_deadline(&mut self, ttls: &Ttls) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for list in ExpireList::ALL {
            loop {
                let Some(&(id, stamp)) = self.queues.queue_mut(list).front() else {
                    break;
                };
                let valid = self
                    .sessions
                    .get(&id)
                    .is_some_and(|session| session.list == list && session.update_time == stamp);
                if !valid {
                    self.queues.queue_mut(list).pop_front();
                    continue;
                }
                let deadline = stamp + ttls.for_list(list);
                earliest = Some(match earliest {
                    Some(current) if current <= deadline => current,
                    _ => deadline,
                });
                break;
            }
        }
        earliest
    }
}
