//! The pending-SYN packet queue.
//!
//! An unsolicited IPv4 SYN may be the first half of a simultaneous open, so
//! instead of answering it immediately the translator parks the packet here
//! against its freshly created V4 INIT session. If the matching IPv6 SYN
//! arrives in time the packet is discarded quietly; if the session's timer
//! fires first, the stored packet is returned to the caller so it can be
//! answered with an ICMP error. Capacity is bounded and the oldest packet
//! loses its spot on overflow.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;

use crate::session::SessionId;

/// A bounded store of one held-back IPv4 SYN per session
#[derive(Debug)]
pub struct PktQueue {
    packets: FxHashMap<SessionId, Vec<u8>>,
    arrival_order: VecDeque<SessionId>,
    max_pkts: usize,
}

impl PktQueue {
    /// Construct a new queue holding at most `max_pkts` packets
    #[must_use]
    pub fn new(max_pkts: usize) -> Self {
        Self {
            packets: FxHashMap::default(),
            arrival_order: VecDeque::new(),
            max_pkts,
        }
    }

    /// Change the capacity. Overflow is resolved on the next `add`.
    pub fn set_max_pkts(&mut self, max_pkts: usize) {
        self.max_pkts = max_pkts;
    }

    /// Park a packet for a session. A session holds at most one packet; a
    /// second `add` replaces the first. On overflow the oldest packet in
    /// the queue is silently dropped, which RFC6146 permits.
    pub fn add(&mut self, session: SessionId, packet: Vec<u8>) {
        while self.packets.len() >= self.max_pkts.max(1) && !self.packets.contains_key(&session) {
            // Arrival order may contain ids whose packet was already
            // claimed; skip those until a live victim turns up
            match self.arrival_order.pop_front() {
                Some(oldest) => {
                    if self.packets.remove(&oldest).is_some() {
                        log::debug!("Pending-SYN queue full, dropping oldest packet");
                    }
                }
                None => break,
            }
        }
        if self.packets.insert(session, packet).is_none() {
            self.arrival_order.push_back(session);
        }
    }

    /// Take the packet held for a session, if any. Used both when the
    /// simultaneous open completes (the packet is dropped) and when the
    /// session times out (the packet seeds an ICMP error).
    pub fn remove(&mut self, session: SessionId) -> Option<Vec<u8>> {
        self.packets.remove(&session)
    }

    /// Number of packets currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionTable;
    use crate::tuple::{L4Proto, Transport4, Tuple4};
    use crate::{Bib, Transport6};
    use rfc6052::Pool6;
    use std::time::Instant;

    fn ids(count: usize) -> Vec<SessionId> {
        // Real SessionIds come from a table; mint some through one
        let mut table = SessionTable::new(L4Proto::Tcp);
        let mut bib = Bib::new();
        let mut pool6 = Pool6::new();
        pool6.add("64:ff9b::/96".parse().unwrap()).unwrap();
        (0..count)
            .map(|index| {
                #[allow(clippy::cast_possible_truncation)]
                let port = 1000 + index as u16;
                let bib_id = bib
                    .add(
                        Transport6::new("2001:db8::1".parse().unwrap(), port),
                        Transport4::new("192.0.2.1".parse().unwrap(), port),
                        false,
                    )
                    .unwrap();
                let tuple = Tuple4::new(
                    Transport4::new("192.168.2.1".parse().unwrap(), 2000),
                    Transport4::new("192.0.2.1".parse().unwrap(), port),
                    L4Proto::Tcp,
                );
                table
                    .get_or_create_4(
                        &tuple,
                        bib_id,
                        bib.get(bib_id).unwrap(),
                        &pool6,
                        Instant::now(),
                    )
                    .unwrap()
                    .0
            })
            .collect()
    }

    #[test]
    fn test_store_and_claim() {
        let sessions = ids(1);
        let mut queue = PktQueue::new(8);
        queue.add(sessions[0], vec![1, 2, 3]);
        assert_eq!(queue.remove(sessions[0]), Some(vec![1, 2, 3]));
        assert_eq!(queue.remove(sessions[0]), None);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let sessions = ids(3);
        let mut queue = PktQueue::new(2);
        queue.add(sessions[0], vec![0]);
        queue.add(sessions[1], vec![1]);
        queue.add(sessions[2], vec![2]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove(sessions[0]), None);
        assert_eq!(queue.remove(sessions[1]), Some(vec![1]));
        assert_eq!(queue.remove(sessions[2]), Some(vec![2]));
    }

    #[test]
    fn test_replacing_does_not_evict() {
        let sessions = ids(2);
        let mut queue = PktQueue::new(2);
        queue.add(sessions[0], vec![0]);
        queue.add(sessions[1], vec![1]);
        queue.add(sessions[0], vec![9]);
        assert_eq!(queue.remove(sessions[0]), Some(vec![9]));
        assert_eq!(queue.remove(sessions[1]), Some(vec![1]));
    }
}
