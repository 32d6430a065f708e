//! Session lifetime bookkeeping.
//!
//! Sessions queue on five FIFO lists, one per timeout class. A list is
//! ordered by update time because touching a session always re-appends it
//! at the tail, so the expiry walk can stop at the first entry that has not
//! aged out yet. Entries are invalidated lazily: moving a session to a
//! different list (or deleting it) leaves the old queue entry behind, and
//! the walk discards entries whose stamp no longer matches the session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::session::{Pair6, Session, SessionId};

/// The five timeout classes of RFC6146
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireList {
    Udp,
    Icmp,
    TcpEst,
    TcpTrans,
    Syn,
}

impl ExpireList {
    pub const ALL: [ExpireList; 5] = [
        ExpireList::Udp,
        ExpireList::Icmp,
        ExpireList::TcpEst,
        ExpireList::TcpTrans,
        ExpireList::Syn,
    ];

    fn index(self) -> usize {
        match self {
            ExpireList::Udp => 0,
            ExpireList::Icmp => 1,
            ExpireList::TcpEst => 2,
            ExpireList::TcpTrans => 3,
            ExpireList::Syn => 4,
        }
    }
}

/// The configured time-to-live of each timeout class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttls {
    pub udp: Duration,
    pub icmp: Duration,
    pub tcp_est: Duration,
    pub tcp_trans: Duration,
    pub syn: Duration,
}

impl Ttls {
    #[must_use]
    pub fn for_list(&self, list: ExpireList) -> Duration {
        match list {
            ExpireList::Udp => self.udp,
            ExpireList::Icmp => self.icmp,
            ExpireList::TcpEst => self.tcp_est,
            ExpireList::TcpTrans => self.tcp_trans,
            ExpireList::Syn => self.syn,
        }
    }
}

impl Default for Ttls {
    /// The RFC6146 defaults
    fn default() -> Self {
        Self {
            udp: Duration::from_secs(5 * 60),
            icmp: Duration::from_secs(60),
            tcp_est: Duration::from_secs(2 * 60 * 60),
            tcp_trans: Duration::from_secs(4 * 60),
            syn: Duration::from_secs(6),
        }
    }
}

/// What happened to a session during an expiry walk.
///
/// Side effects (releasing BIB references and pool ports, sending probes or
/// ICMP errors) belong to the caller, after the table's lock is gone.
#[derive(Debug, Clone)]
pub enum ExpireEvent {
    /// The session aged out and was removed
    Deleted { id: SessionId, session: Session },
    /// A V4 INIT session timed out with no matching IPv6 SYN; if its packet
    /// is still queued, answer it with an ICMP error
    SynTimeout { id: SessionId, session: Session },
    /// An established TCP session went quiet; probe its IPv6 side
    Probe { id: SessionId, pair6: Pair6 },
}

/// The FIFO queues backing one session table's timeout classes
#[derive(Debug, Default)]
pub(crate) struct ExpireQueues {
    queues: [VecDeque<(u64, Instant)>; 5],
}

impl ExpireQueues {
    pub(crate) fn push(&mut self, list: ExpireList, id: u64, stamp: Instant) {
        self.queues[list.index()].push_back((id, stamp));
    }

    pub(crate) fn queue_mut(&mut self, list: ExpireList) -> &mut VecDeque<(u64, Instant)> {
        &mut self.queues[list.index()]
    }
}
