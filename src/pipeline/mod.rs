//! The packet pipeline: tuple extraction, filtering, outgoing-tuple
//! computation, translation, hairpin detection and emission, plus the
//! expiry driver that ages the session tables.
//!
//! Lock order, everywhere: `pool6` and `pktqueue` stand alone; `pool4` and
//! a session-table mutex only ever nest inside the matching BIB mutex;
//! BIB before sessions when both are held. Timers are rescheduled and
//! packets sent only after every table lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use pnet_packet::icmp::{IcmpCode, IcmpTypes};
use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Types};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::tcp::TcpFlags;

use rfc6052::Pool6;
use stateful_nat::{
    Bib, ExpireEvent, L4Proto, Pair6, PktQueue, Pool4, Session, SessionId, SessionTable,
    Transport4, Transport6,
};
use xlat64::protocols::{Ipv6Packet, TcpPacket};
use xlat64::{icmp_error, Error as XlatError};

use crate::config::RuntimeConfig;
use crate::metrics;

pub mod filtering;
pub mod incoming;
pub mod outgoing;

use filtering::{FilterVerdict, IcmpReply};
use incoming::{IncomingError, IncomingPacket};

/// Where translated (and self-originated) packets go. The daemon backs
/// this with the TUN device; tests collect the bytes.
pub trait PacketSink: Send + Sync {
    fn send(&self, packet: &[u8]);
}

/// What the host should do with the packet it handed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Translated; the result left through the sink
    Continue,
    /// Not for translation; give it back to the host stack
    Accept,
    /// Discarded (an ICMP error may have been sent)
    Drop,
    /// Retained by the pending-SYN queue; the host must not free it
    Stolen,
}

/// How long the expiry thread naps when no session holds a deadline
const IDLE_EXPIRY_WAIT: Duration = Duration::from_secs(60);

/// The translator core: every table, pool and knob, behind their locks
pub struct Nat64 {
    pub(crate) pool6: Mutex<Pool6>,
    pub(crate) pool4: Mutex<Pool4>,
    bib_tables: [Mutex<Bib>; 3],
    session_tables: [Mutex<SessionTable>; 3],
    pub(crate) pktqueue: Mutex<PktQueue>,
    pub(crate) config: ArcSwap<RuntimeConfig>,
    sink: Arc<dyn PacketSink>,
    expiry_pending: Mutex<bool>,
    expiry_wake: Condvar,
    shutdown: AtomicBool,
}

impl Nat64 {
    /// Construct a new translator core
    pub fn new(
        pool6: Pool6,
        pool4: Pool4,
        config: RuntimeConfig,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        let max_pkts = config.pktqueue.max_pkts;
        Self {
            pool6: Mutex::new(pool6),
            pool4: Mutex::new(pool4),
            bib_tables: std::array::from_fn(|_| Mutex::new(Bib::new())),
            session_tables: std::array::from_fn(|index| {
                Mutex::new(SessionTable::new(L4Proto::ALL[index]))
            }),
            pktqueue: Mutex::new(PktQueue::new(max_pkts)),
            config: ArcSwap::from_pointee(config),
            sink,
            expiry_pending: Mutex::new(false),
            expiry_wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn bib(&self, l4: L4Proto) -> &Mutex<Bib> {
        &self.bib_tables[l4.index()]
    }

    pub(crate) fn sessions(&self, l4: L4Proto) -> &Mutex<SessionTable> {
        &self.session_tables[l4.index()]
    }

    /// Pin a static binding from the configuration: the pool port is
    /// reserved for good and the entry never expires
    pub fn add_static_binding(
        &self,
        l4: L4Proto,
        addr6: Transport6,
        addr4: Transport4,
    ) -> Result<(), stateful_nat::Error> {
        let mut bib = self.bib(l4).lock().unwrap();
        self.pool4
            .lock()
            .unwrap()
            .reserve(addr4.addr, addr4.id, l4)?;
        match bib.add(addr6, addr4, true) {
            Ok(_) => {
                log::info!("Static {} binding {} <-> {}", l4, addr6, addr4);
                Ok(())
            }
            Err(error) => {
                self.pool4.lock().unwrap().release(addr4.addr, addr4.id, l4);
                Err(error)
            }
        }
    }

    /// Run one packet through the pipeline
    pub fn process(&self, packet: &[u8]) -> Verdict {
        self.process_at(packet, Instant::now(), 0)
    }

    pub(crate) fn process_at(&self, packet_bytes: &[u8], now: Instant, depth: u8) -> Verdict {
        let family = match packet_bytes.first().map(|byte| byte >> 4) {
            Some(4) => metrics::FAMILY_V4,
            _ => metrics::FAMILY_V6,
        };

        let packet = match IncomingPacket::parse(packet_bytes) {
            Ok(packet) => packet,
            Err(_) => {
                metrics::HEADER_ERRORS.with_label_values(&[family]).inc();
                return self.record(family, Verdict::Drop);
            }
        };

        // Traffic not addressed to the translation prefix or the pool is
        // the host's own business
        let ours = match &packet {
            IncomingPacket::V6(packet) => self
                .pool6
                .lock()
                .unwrap()
                .contains(&packet.destination_address),
            IncomingPacket::V4(packet) => {
                self.pool4.lock().unwrap().contains(packet.destination_address)
            }
        };
        if !ours {
            return self.record(family, Verdict::Accept);
        }

        let extracted = match incoming::extract_tuple(&packet) {
            Ok(Some(extracted)) => extracted,
            Ok(None) => return self.record(family, Verdict::Accept),
            Err(IncomingError::Malformed) => {
                metrics::HEADER_ERRORS.with_label_values(&[family]).inc();
                return self.record(family, Verdict::Drop);
            }
            Err(IncomingError::UnknownProtocol(protocol)) => {
                log::debug!("Cannot translate protocol {}", protocol);
                metrics::UNKNOWN_PROTOS.with_label_values(&[family]).inc();
                return self.record(family, Verdict::Drop);
            }
        };

        match filtering::filter(self, &packet, &extracted, packet_bytes, now) {
            FilterVerdict::Stolen => self.record(family, Verdict::Stolen),
            FilterVerdict::Drop(reply) => {
                if let Some(reply) = reply {
                    self.send_icmp_reply(reply, packet_bytes);
                }
                self.record(family, Verdict::Drop)
            }
            FilterVerdict::Translate(session) => {
                let verdict = self.translate_and_send(&packet, &session, packet_bytes, now, depth);
                self.record(family, verdict)
            }
        }
    }

    fn record(&self, family: &str, verdict: Verdict) -> Verdict {
        let label = match verdict {
            Verdict::Continue => "translated",
            Verdict::Accept => "accepted",
            Verdict::Drop => "dropped",
            Verdict::Stolen => "stolen",
        };
        metrics::PACKET_COUNTER
            .with_label_values(&[family, label])
            .inc();
        verdict
    }

    /// Stages four to six: build the other family's packet, loop hairpin
    /// traffic back around, emit everything else
    fn translate_and_send(
        &self,
        packet: &IncomingPacket,
        session: &Session,
        raw: &[u8],
        now: Instant,
        depth: u8,
    ) -> Verdict {
        let options = self.config.load().translate.to_options();
        match packet {
            IncomingPacket::V6(packet) => {
                let (source, destination) = outgoing::outgoing_4(session);
                match xlat64::xlat::translate_ipv6_to_ipv4(packet, source, destination, &options) {
                    Ok(translated) => {
                        // A destination the pool owns means another IPv6
                        // client is on the far side; go around again
                        if self.pool4.lock().unwrap().contains(*destination.ip()) {
                            if depth >= 1 {
                                log::warn!("Hairpin loop detected, dropping");
                                return Verdict::Drop;
                            }
                            return self.process_at(&translated, now, depth + 1);
                        }
                        self.sink.send(&translated);
                        Verdict::Continue
                    }
                    Err(error) => self.handle_xlat_error(error, raw, true),
                }
            }
            IncomingPacket::V4(packet) => {
                let (source, destination) = outgoing::outgoing_6(session);
                match xlat64::xlat::translate_ipv4_to_ipv6(packet, source, destination, &options) {
                    Ok(translated) => {
                        for fragment in &translated {
                            self.sink.send(fragment);
                        }
                        Verdict::Continue
                    }
                    Err(error) => self.handle_xlat_error(error, raw, false),
                }
            }
        }
    }

    /// Map a translation failure onto its drop policy, answering
    /// with an ICMP error in the offender's own family where one is due
    fn handle_xlat_error(&self, error: XlatError, raw: &[u8], from_v6: bool) -> Verdict {
        let family = if from_v6 {
            metrics::FAMILY_V6
        } else {
            metrics::FAMILY_V4
        };
        match error {
            XlatError::HopLimitExceeded => {
                let reply = if from_v6 {
                    IcmpReply::V6(Icmpv6Types::TimeExceeded, Icmpv6Code(0))
                } else {
                    IcmpReply::V4(IcmpTypes::TimeExceeded, IcmpCode(0))
                };
                self.send_icmp_reply(reply, raw);
            }
            XlatError::FragmentationNeeded { mtu } => {
                let mtu = mtu.to_be_bytes();
                self.send_icmp_error_v4(
                    IcmpTypes::DestinationUnreachable,
                    IcmpCode(4),
                    [0, 0, mtu[0], mtu[1]],
                    raw,
                );
            }
            XlatError::UnsupportedProtocol(protocol) => {
                log::debug!("Cannot translate protocol {}", protocol);
                metrics::UNKNOWN_PROTOS.with_label_values(&[family]).inc();
            }
            error => {
                log::debug!("Translation failed: {}", error);
                metrics::HEADER_ERRORS.with_label_values(&[family]).inc();
            }
        }
        Verdict::Drop
    }

    fn send_icmp_reply(&self, reply: IcmpReply, offender: &[u8]) {
        match reply {
            IcmpReply::V4(icmp_type, icmp_code) => {
                self.send_icmp_error_v4(icmp_type, icmp_code, [0; 4], offender);
            }
            IcmpReply::V6(icmp_type, icmp_code) => {
                match icmp_error::icmpv6_error(icmp_type, icmp_code, [0; 4], offender) {
                    Ok(packet) => {
                        metrics::ICMP_ERRORS_SENT
                            .with_label_values(&[metrics::FAMILY_V6])
                            .inc();
                        self.sink.send(&packet);
                    }
                    Err(error) => log::debug!("Cannot build ICMPv6 error: {}", error),
                }
            }
        }
    }

    fn send_icmp_error_v4(
        &self,
        icmp_type: pnet_packet::icmp::IcmpType,
        icmp_code: IcmpCode,
        rest_of_header: [u8; 4],
        offender: &[u8],
    ) {
        match icmp_error::icmpv4_error(icmp_type, icmp_code, rest_of_header, offender) {
            Ok(packet) => {
                metrics::ICMP_ERRORS_SENT
                    .with_label_values(&[metrics::FAMILY_V4])
                    .inc();
                self.sink.send(&packet);
            }
            Err(error) => log::debug!("Cannot build ICMPv4 error: {}", error),
        }
    }

    /// Nudge the expiry thread: a session was created or a timer got
    /// shorter, so its current nap may overshoot
    pub(crate) fn wake_expirer(&self) {
        let mut pending = self.expiry_pending.lock().unwrap();
        *pending = true;
        self.expiry_wake.notify_one();
    }

    /// Walk every table's expiry lists once. Returns the earliest deadline
    /// still pending. Probe packets, ICMP answers and port releases all
    /// happen after the table locks are dropped.
    pub fn expire_at(&self, now: Instant) -> Option<Instant> {
        let ttls = self.config.load().ttls();
        let mut earliest: Option<Instant> = None;

        for l4 in L4Proto::ALL {
            let mut releases: Vec<Transport4> = Vec::new();
            let mut dead_sessions: Vec<SessionId> = Vec::new();
            let mut syn_timeouts: Vec<SessionId> = Vec::new();
            let mut probes: Vec<Pair6> = Vec::new();

            {
                let mut bib = self.bib(l4).lock().unwrap();
                let mut sessions = self.sessions(l4).lock().unwrap();
                let (events, deadline) = sessions.expire(now, &ttls);
                if let Some(deadline) = deadline {
                    earliest = Some(match earliest {
                        Some(current) if current <= deadline => current,
                        _ => deadline,
                    });
                }
                for event in events {
                    match event {
                        ExpireEvent::Deleted { id, session } => {
                            log::debug!("Session {} <-> {} expired", session.pair6.remote, session.pair4.remote);
                            if let Some(dead) = bib.dec_sessions(session.bib) {
                                releases.push(dead.addr4);
                            }
                            dead_sessions.push(id);
                        }
                        ExpireEvent::SynTimeout { id, session } => {
                            if let Some(dead) = bib.dec_sessions(session.bib) {
                                releases.push(dead.addr4);
                            }
                            syn_timeouts.push(id);
                        }
                        ExpireEvent::Probe { pair6, .. } => probes.push(pair6),
                    }
                }
                #[allow(clippy::cast_possible_wrap)]
                metrics::SESSION_GAUGE
                    .with_label_values(&[&l4.to_string()])
                    .set(sessions.count() as i64);
            }

            if !releases.is_empty() {
                let mut pool4 = self.pool4.lock().unwrap();
                for transport in &releases {
                    pool4.release(transport.addr, transport.id, l4);
                }
            }

            // Sessions that died still holding a parked SYN: answer the
            // ones whose timer ran out, silently forget the rest
            let mut answers: Vec<Vec<u8>> = Vec::new();
            {
                let mut pktqueue = self.pktqueue.lock().unwrap();
                for id in dead_sessions {
                    pktqueue.remove(id);
                }
                for id in syn_timeouts {
                    if let Some(stored) = pktqueue.remove(id) {
                        answers.push(stored);
                    }
                }
            }
            for stored in answers {
                self.send_icmp_error_v4(
                    IcmpTypes::DestinationUnreachable,
                    IcmpCode(1),
                    [0; 4],
                    &stored,
                );
            }

            for pair6 in probes {
                log::debug!("Probing quiet TCP session toward {}", pair6.remote);
                self.sink.send(&tcp_probe(&pair6));
            }

            #[allow(clippy::cast_possible_wrap)]
            metrics::POOL4_PORTS_GAUGE
                .with_label_values(&[&l4.to_string()])
                .set(self.pool4.lock().unwrap().used_ports(l4) as i64);
        }

        earliest
    }

    /// Spawn the timer thread driving [`Nat64::expire_at`]
    pub fn run_expirer(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let core = Arc::clone(self);
        std::thread::Builder::new()
            .name("statemask-expiry".to_string())
            .spawn(move || {
                while !core.shutdown.load(Ordering::Relaxed) {
                    let deadline = core.expire_at(Instant::now());
                    let wait = deadline
                        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                        .unwrap_or(IDLE_EXPIRY_WAIT);

                    let mut pending = core.expiry_pending.lock().unwrap();
                    if !*pending {
                        pending = core
                            .expiry_wake
                            .wait_timeout(pending, wait)
                            .unwrap()
                            .0;
                    }
                    *pending = false;
                }
            })
            .unwrap()
    }

    /// Stop the expiry thread. Deterministic teardown: callers join the
    /// handle from [`Nat64::run_expirer`] before dropping the core.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake_expirer();
    }

    /// Remove sessions selected by `select` from every table, releasing
    /// BIB references, pool ports and parked packets as they go
    pub(crate) fn cascade_delete<F>(&self, select: F)
    where
        F: Fn(&mut SessionTable) -> Vec<(SessionId, Session)>,
    {
        for l4 in L4Proto::ALL {
            let mut releases: Vec<Transport4> = Vec::new();
            let mut dead_sessions: Vec<SessionId> = Vec::new();
            {
                let mut bib = self.bib(l4).lock().unwrap();
                let mut sessions = self.sessions(l4).lock().unwrap();
                for (id, session) in select(&mut sessions) {
                    if let Some(dead) = bib.dec_sessions(session.bib) {
                        releases.push(dead.addr4);
                    }
                    dead_sessions.push(id);
                }
            }
            {
                let mut pool4 = self.pool4.lock().unwrap();
                for transport in &releases {
                    pool4.release(transport.addr, transport.id, l4);
                }
            }
            let mut pktqueue = self.pktqueue.lock().unwrap();
            for id in dead_sessions {
                pktqueue.remove(id);
            }
        }
    }
}

/// The keepalive sent to an established-but-quiet TCP session's IPv6 side:
/// a bare ACK with zeroed sequence numbers, meant only to provoke an
/// answer (or a RST)
fn tcp_probe(pair6: &Pair6) -> Vec<u8> {
    Ipv6Packet {
        traffic_class: 0,
        flow_label: 0,
        next_header: IpNextHeaderProtocols::Tcp,
        hop_limit: 64,
        source_address: pair6.local.addr,
        destination_address: pair6.remote.addr,
        fragment: None,
        payload: TcpPacket {
            source: std::net::SocketAddr::new(pair6.local.addr.into(), pair6.local.id),
            destination: std::net::SocketAddr::new(pair6.remote.addr.into(), pair6.remote.id),
            sequence: 0,
            ack_number: 0,
            flags: TcpFlags::ACK,
            window_size: 0,
            urgent_pointer: 0,
            options: vec![],
            payload: vec![],
        }
        .to_bytes(),
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    use pnet_packet::icmp::IcmpTypes;
    use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Types};

    use stateful_nat::TcpState;
    use xlat64::protocols::{IcmpMessage, Icmpv6Message, Ipv4Packet, UdpPacket};

    /// A sink that just remembers what the translator emitted
    struct CollectSink(Mutex<Vec<Vec<u8>>>);

    impl PacketSink for CollectSink {
        fn send(&self, packet: &[u8]) {
            self.0.lock().unwrap().push(packet.to_vec());
        }
    }

    impl CollectSink {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    /// A fresh core with pool6={64:ff9b::/96} and pool4={192.0.2.1}
    fn test_core() -> (Arc<Nat64>, Arc<CollectSink>) {
        let mut pool6 = Pool6::new();
        pool6.add("64:ff9b::/96".parse().unwrap()).unwrap();
        let mut pool4 = Pool4::new();
        pool4.add("192.0.2.1".parse().unwrap()).unwrap();
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let core = Arc::new(Nat64::new(
            pool6,
            pool4,
            crate::config::RuntimeConfig::default(),
            sink.clone(),
        ));
        (core, sink)
    }

    fn v6(addr: &str) -> Ipv6Addr {
        addr.parse().unwrap()
    }

    fn v4(addr: &str) -> Ipv4Addr {
        addr.parse().unwrap()
    }

    fn v6_udp_packet(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
        Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Udp,
            hop_limit: 64,
            source_address: v6(src),
            destination_address: v6(dst),
            fragment: None,
            payload: UdpPacket {
                source: std::net::SocketAddr::new(v6(src).into(), sport),
                destination: std::net::SocketAddr::new(v6(dst).into(), dport),
                payload: payload.to_vec(),
            }
            .to_bytes(),
        }
        .to_bytes()
    }

    fn v4_udp_packet(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
        Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 0x77aa,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: IpNextHeaderProtocols::Udp,
            source_address: v4(src),
            destination_address: v4(dst),
            payload: UdpPacket {
                source: std::net::SocketAddr::new(v4(src).into(), sport),
                destination: std::net::SocketAddr::new(v4(dst).into(), dport),
                payload: payload.to_vec(),
            }
            .to_bytes(),
        }
        .to_bytes()
    }

    fn v6_tcp_packet(src: &str, sport: u16, dst: &str, dport: u16, flags: u8) -> Vec<u8> {
        Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Tcp,
            hop_limit: 64,
            source_address: v6(src),
            destination_address: v6(dst),
            fragment: None,
            payload: TcpPacket {
                source: std::net::SocketAddr::new(v6(src).into(), sport),
                destination: std::net::SocketAddr::new(v6(dst).into(), dport),
                sequence: 100,
                ack_number: 0,
                flags,
                window_size: 8192,
                urgent_pointer: 0,
                options: vec![],
                payload: vec![],
            }
            .to_bytes(),
        }
        .to_bytes()
    }

    fn v4_tcp_packet(src: &str, sport: u16, dst: &str, dport: u16, flags: u8) -> Vec<u8> {
        Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 9,
            flags: 0b010,
            fragment_offset: 0,
            ttl: 64,
            protocol: IpNextHeaderProtocols::Tcp,
            source_address: v4(src),
            destination_address: v4(dst),
            payload: TcpPacket {
                source: std::net::SocketAddr::new(v4(src).into(), sport),
                destination: std::net::SocketAddr::new(v4(dst).into(), dport),
                sequence: 200,
                ack_number: 0,
                flags,
                window_size: 8192,
                urgent_pointer: 0,
                options: vec![],
                payload: vec![],
            }
            .to_bytes(),
        }
        .to_bytes()
    }

    fn parse_v4(bytes: &[u8]) -> Ipv4Packet {
        Ipv4Packet::from_bytes(bytes).unwrap()
    }

    fn parse_v6(bytes: &[u8]) -> Ipv6Packet {
        Ipv6Packet::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_udp_v6_first_packet_creates_state() {
        let (core, sink) = test_core();
        let verdict = core.process(&v6_udp_packet(
            "2001:db8::1",
            1000,
            "64:ff9b::c0a8:201",
            2000,
            b"hello",
        ));
        assert_eq!(verdict, Verdict::Continue);

        // A binding and a session exist now
        assert_eq!(core.bib(L4Proto::Udp).lock().unwrap().len(), 1);
        assert_eq!(core.sessions(L4Proto::Udp).lock().unwrap().count(), 1);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v4(&sent[0]);
        assert_eq!(packet.source_address, v4("192.0.2.1"));
        assert_eq!(packet.destination_address, v4("192.168.2.1"));
        assert_eq!(packet.ttl, 63);

        let datagram = UdpPacket::from_bytes(
            &packet.payload,
            packet.source_address.into(),
            packet.destination_address.into(),
        )
        .unwrap();
        // The whole pool was free, so the source port survived verbatim
        assert_eq!(datagram.source.port(), 1000);
        assert_eq!(datagram.destination.port(), 2000);
        assert_eq!(datagram.payload, b"hello");
    }

    #[test]
    fn test_udp_v4_reply_uses_same_session() {
        let (core, sink) = test_core();
        core.process(&v6_udp_packet(
            "2001:db8::1",
            1000,
            "64:ff9b::c0a8:201",
            2000,
            b"ping",
        ));
        sink.take();

        let verdict = core.process(&v4_udp_packet("192.168.2.1", 2000, "192.0.2.1", 1000, b"pong"));
        assert_eq!(verdict, Verdict::Continue);

        // Still exactly one binding and one session
        assert_eq!(core.bib(L4Proto::Udp).lock().unwrap().len(), 1);
        assert_eq!(core.sessions(L4Proto::Udp).lock().unwrap().count(), 1);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v6(&sent[0]);
        assert_eq!(packet.source_address, v6("64:ff9b::c0a8:201"));
        assert_eq!(packet.destination_address, v6("2001:db8::1"));

        let datagram = UdpPacket::from_bytes(
            &packet.payload,
            packet.source_address.into(),
            packet.destination_address.into(),
        )
        .unwrap();
        assert_eq!(datagram.source.port(), 2000);
        assert_eq!(datagram.destination.port(), 1000);
        assert_eq!(datagram.payload, b"pong");
    }

    #[test]
    fn test_unowned_traffic_is_accepted() {
        let (core, sink) = test_core();
        // Destination outside the translation prefix
        assert_eq!(
            core.process(&v6_udp_packet("2001:db8::1", 1, "2001:db8::2", 2, b"")),
            Verdict::Accept
        );
        // Destination outside the pool
        assert_eq!(
            core.process(&v4_udp_packet("192.168.2.1", 1, "198.51.100.1", 2, b"")),
            Verdict::Accept
        );
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_unsolicited_v4_udp_is_prohibited() {
        let (core, sink) = test_core();
        let verdict = core.process(&v4_udp_packet("192.168.2.1", 2000, "192.0.2.1", 1000, b"?"));
        assert_eq!(verdict, Verdict::Drop);

        // Answered with communication administratively prohibited
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v4(&sent[0]);
        assert_eq!(packet.protocol, IpNextHeaderProtocols::Icmp);
        assert_eq!(packet.destination_address, v4("192.168.2.1"));
        let message = IcmpMessage::from_bytes(&packet.payload).unwrap();
        assert_eq!(message.icmp_type, IcmpTypes::DestinationUnreachable);
        assert_eq!(message.icmp_code, IcmpCode(13));
    }

    #[test]
    fn test_pool_exhaustion_answers_with_icmp() {
        let (core, sink) = test_core();
        {
            let mut pool4 = core.pool4.lock().unwrap();
            for port in 0..=u16::MAX {
                let _ = pool4.reserve(v4("192.0.2.1"), port, L4Proto::Udp);
            }
        }
        let verdict = core.process(&v6_udp_packet(
            "2001:db8::1",
            1000,
            "64:ff9b::c0a8:201",
            2000,
            b"",
        ));
        assert_eq!(verdict, Verdict::Drop);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v6(&sent[0]);
        assert_eq!(packet.next_header, IpNextHeaderProtocols::Icmpv6);
        assert_eq!(packet.destination_address, v6("2001:db8::1"));
        let message = Icmpv6Message::from_bytes(&packet.payload).unwrap();
        assert_eq!(message.icmp_type, Icmpv6Types::DestinationUnreachable);
        assert_eq!(message.icmp_code, Icmpv6Code(3));
    }

    #[test]
    fn test_tcp_simultaneous_open_completes() {
        let (core, sink) = test_core();
        core.add_static_binding(
            L4Proto::Tcp,
            Transport6::new(v6("2001:db8::1"), 5000),
            Transport4::new(v4("192.0.2.1"), 7777),
        )
        .unwrap();

        // The unsolicited IPv4 SYN is parked, not answered
        let start = Instant::now();
        let syn = v4_tcp_packet("192.168.2.1", 2000, "192.0.2.1", 7777, TcpFlags::SYN);
        assert_eq!(core.process_at(&syn, start, 0), Verdict::Stolen);
        assert!(sink.take().is_empty());
        assert_eq!(core.pktqueue.lock().unwrap().len(), 1);
        {
            let sessions = core.sessions(L4Proto::Tcp).lock().unwrap();
            let (_, session) = sessions
                .iter_from(None)
                .next()
                .expect("V4 INIT session missing");
            assert_eq!(session.state, TcpState::V4Init);
        }

        // The matching IPv6 SYN lands within the window
        let syn6 = v6_tcp_packet("2001:db8::1", 5000, "64:ff9b::c0a8:201", 2000, TcpFlags::SYN);
        assert_eq!(
            core.process_at(&syn6, start + Duration::from_secs(2), 0),
            Verdict::Continue
        );

        // Established, and the parked SYN was quietly discarded
        assert!(core.pktqueue.lock().unwrap().is_empty());
        {
            let sessions = core.sessions(L4Proto::Tcp).lock().unwrap();
            let (_, session) = sessions.iter_from(None).next().unwrap();
            assert_eq!(session.state, TcpState::Established);
        }

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v4(&sent[0]);
        assert_eq!(packet.source_address, v4("192.0.2.1"));
        assert_eq!(packet.destination_address, v4("192.168.2.1"));
    }

    #[test]
    fn test_tcp_syn_timeout_answers_with_icmp() {
        let (core, sink) = test_core();
        core.add_static_binding(
            L4Proto::Tcp,
            Transport6::new(v6("2001:db8::1"), 5000),
            Transport4::new(v4("192.0.2.1"), 7777),
        )
        .unwrap();

        let start = Instant::now();
        let syn = v4_tcp_packet("192.168.2.1", 2000, "192.0.2.1", 7777, TcpFlags::SYN);
        assert_eq!(core.process_at(&syn, start, 0), Verdict::Stolen);

        // Nothing for six seconds; the backoff timer fires
        core.expire_at(start + Duration::from_secs(6));

        assert_eq!(core.sessions(L4Proto::Tcp).lock().unwrap().count(), 0);
        assert!(core.pktqueue.lock().unwrap().is_empty());
        // The static binding itself survives
        assert_eq!(core.bib(L4Proto::Tcp).lock().unwrap().len(), 1);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v4(&sent[0]);
        assert_eq!(packet.protocol, IpNextHeaderProtocols::Icmp);
        assert_eq!(packet.destination_address, v4("192.168.2.1"));
        let message = IcmpMessage::from_bytes(&packet.payload).unwrap();
        assert_eq!(message.icmp_type, IcmpTypes::DestinationUnreachable);
        assert_eq!(message.icmp_code, IcmpCode(1));
        // The quoted offender is the stored SYN
        let quoted = Ipv4Packet::from_bytes(&message.body).unwrap();
        assert_eq!(quoted.destination_address, v4("192.0.2.1"));
    }

    #[test]
    fn test_icmp_echo_round_trip() {
        let (core, sink) = test_core();

        let request = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Icmpv6,
            hop_limit: 64,
            source_address: v6("2001:db8::1"),
            destination_address: v6("64:ff9b::c0a8:201"),
            fragment: None,
            payload: Icmpv6Message {
                icmp_type: Icmpv6Types::EchoRequest,
                icmp_code: Icmpv6Code(0),
                rest_of_header: [0x12, 0x34, 0x00, 0x01],
                body: b"ping".to_vec(),
            }
            .to_bytes(v6("2001:db8::1"), v6("64:ff9b::c0a8:201")),
        }
        .to_bytes();
        assert_eq!(core.process(&request), Verdict::Continue);

        let sent = sink.take();
        let packet = parse_v4(&sent[0]);
        assert_eq!(packet.protocol, IpNextHeaderProtocols::Icmp);
        let message = IcmpMessage::from_bytes(&packet.payload).unwrap();
        assert_eq!(message.icmp_type, IcmpTypes::EchoRequest);
        // The identifier was free on the pool side, so it was preserved
        assert_eq!(message.echo_id(), 0x1234);
        assert_eq!(message.body, b"ping");

        // The reply finds its way back with the original identifier
        let reply = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 1,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: IpNextHeaderProtocols::Icmp,
            source_address: v4("192.168.2.1"),
            destination_address: v4("192.0.2.1"),
            payload: IcmpMessage {
                icmp_type: IcmpTypes::EchoReply,
                icmp_code: IcmpCode(0),
                rest_of_header: [0x12, 0x34, 0x00, 0x01],
                body: b"ping".to_vec(),
            }
            .to_bytes(),
        }
        .to_bytes();
        assert_eq!(core.process(&reply), Verdict::Continue);

        let sent = sink.take();
        let packet = parse_v6(&sent[0]);
        assert_eq!(packet.destination_address, v6("2001:db8::1"));
        let message = Icmpv6Message::from_bytes(&packet.payload).unwrap();
        assert_eq!(message.icmp_type, Icmpv6Types::EchoReply);
        assert_eq!(message.echo_id(), 0x1234);
    }

    #[test]
    fn test_oversized_v4_fragments_toward_v6() {
        let (core, sink) = test_core();
        core.process(&v6_udp_packet(
            "2001:db8::1",
            1000,
            "64:ff9b::c0a8:201",
            2000,
            b"knock",
        ));
        sink.take();

        // A 2000-byte reply with DF clear must leave as a fragment chain
        let big = vec![0x5a; 1972];
        let reply = v4_udp_packet("192.168.2.1", 2000, "192.0.2.1", 1000, &big);
        assert_eq!(reply.len(), 2000);
        assert_eq!(core.process(&reply), Verdict::Continue);

        let sent = sink.take();
        assert_eq!(sent.len(), 2);

        let first = parse_v6(&sent[0]);
        let second = parse_v6(&sent[1]);
        assert!(sent[0].len() <= 1280 && sent[1].len() <= 1280);
        assert!(first.fragment.unwrap().more);
        assert!(!second.fragment.unwrap().more);
        assert_eq!(first.fragment.unwrap().offset, 0);

        // The first fragment leads with the UDP header
        let datagram = UdpPacket::from_bytes(
            &first.payload,
            first.source_address.into(),
            first.destination_address.into(),
        )
        .unwrap();
        assert_eq!(datagram.destination.port(), 1000);

        // Reassembly gives back the whole datagram
        let mut reassembled = first.payload.clone();
        reassembled.extend_from_slice(&second.payload);
        assert_eq!(reassembled.len(), 8 + 1972);
        assert_eq!(&reassembled[8..], big.as_slice());
    }

    #[test]
    fn test_packet_too_big_reaches_the_v4_peer() {
        let (core, sink) = test_core();

        // Establish a TCP session, IPv6 side first
        let syn = v6_tcp_packet("2001:db8::2", 1000, "64:ff9b::c0a8:201", 80, TcpFlags::SYN);
        assert_eq!(core.process(&syn), Verdict::Continue);
        let syn_ack = v4_tcp_packet(
            "192.168.2.1",
            80,
            "192.0.2.1",
            1000,
            TcpFlags::SYN | TcpFlags::ACK,
        );
        assert_eq!(core.process(&syn_ack), Verdict::Continue);
        sink.take();

        // Some router bounces a too-big segment of the v4->v6 direction
        let quoted = v6_tcp_packet("64:ff9b::c0a8:201", 80, "2001:db8::2", 1000, TcpFlags::ACK);
        let ptb = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Icmpv6,
            hop_limit: 64,
            source_address: v6("2001:db8:ffff::1"),
            destination_address: v6("64:ff9b::c0a8:201"),
            fragment: None,
            payload: Icmpv6Message {
                icmp_type: Icmpv6Types::PacketTooBig,
                icmp_code: Icmpv6Code(0),
                rest_of_header: 1400u32.to_be_bytes(),
                body: quoted,
            }
            .to_bytes(v6("2001:db8:ffff::1"), v6("64:ff9b::c0a8:201")),
        }
        .to_bytes();
        assert_eq!(core.process(&ptb), Verdict::Continue);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v4(&sent[0]);
        assert_eq!(packet.destination_address, v4("192.168.2.1"));
        assert_eq!(packet.protocol, IpNextHeaderProtocols::Icmp);

        let message = IcmpMessage::from_bytes(&packet.payload).unwrap();
        assert_eq!(message.icmp_type, IcmpTypes::DestinationUnreachable);
        assert_eq!(message.icmp_code, IcmpCode(4));
        assert_eq!(
            u16::from_be_bytes([message.rest_of_header[2], message.rest_of_header[3]]),
            1380
        );

        // The quoted packet was translated along the session
        let inner = Ipv4Packet::from_bytes(&message.body).unwrap();
        assert_eq!(inner.source_address, v4("192.168.2.1"));
        assert_eq!(inner.destination_address, v4("192.0.2.1"));
        assert_eq!(inner.protocol, IpNextHeaderProtocols::Tcp);
    }

    #[test]
    fn test_established_session_is_probed_then_reaped() {
        let (core, sink) = test_core();
        let start = Instant::now();

        let syn = v6_tcp_packet("2001:db8::2", 1000, "64:ff9b::c0a8:201", 80, TcpFlags::SYN);
        core.process_at(&syn, start, 0);
        let syn_ack = v4_tcp_packet(
            "192.168.2.1",
            80,
            "192.0.2.1",
            1000,
            TcpFlags::SYN | TcpFlags::ACK,
        );
        core.process_at(&syn_ack, start, 0);
        sink.take();

        // Two idle hours later the session earns a probe, not deletion
        let est_ttl = core.config.load().sessiondb.tcp_est_ttl;
        core.expire_at(start + est_ttl);
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let probe = parse_v6(&sent[0]);
        assert_eq!(probe.next_header, IpNextHeaderProtocols::Tcp);
        assert_eq!(probe.destination_address, v6("2001:db8::2"));
        let segment = TcpPacket::from_bytes(
            &probe.payload,
            probe.source_address.into(),
            probe.destination_address.into(),
        )
        .unwrap();
        assert_eq!(segment.sequence, 0);
        assert_eq!(segment.ack_number, 0);
        assert_eq!(core.sessions(L4Proto::Tcp).lock().unwrap().count(), 1);

        // No answer: the transitory timeout finishes the job, and the
        // dynamic binding releases its port
        let trans_ttl = core.config.load().sessiondb.tcp_trans_ttl;
        core.expire_at(start + est_ttl + trans_ttl);
        assert_eq!(core.sessions(L4Proto::Tcp).lock().unwrap().count(), 0);
        assert_eq!(core.bib(L4Proto::Tcp).lock().unwrap().len(), 0);
        assert_eq!(core.pool4.lock().unwrap().used_ports(L4Proto::Tcp), 0);
    }

    #[test]
    fn test_hairpin_reaches_the_other_client() {
        let (core, sink) = test_core();

        // Client B opens a flow, earning the mapping 192.0.2.1:4000
        core.process(&v6_udp_packet(
            "2001:db8::b",
            4000,
            "64:ff9b::c0a8:201",
            9,
            b"warmup",
        ));
        sink.take();

        // Client A talks to B's mapped address through the prefix
        let verdict = core.process(&v6_udp_packet(
            "2001:db8::a",
            1000,
            "64:ff9b::c000:201",
            4000,
            b"hi there",
        ));
        assert_eq!(verdict, Verdict::Continue);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let packet = parse_v6(&sent[0]);
        // The packet went around the loop and came out IPv6 again
        assert_eq!(packet.destination_address, v6("2001:db8::b"));
        let datagram = UdpPacket::from_bytes(
            &packet.payload,
            packet.source_address.into(),
            packet.destination_address.into(),
        )
        .unwrap();
        assert_eq!(datagram.destination.port(), 4000);
        assert_eq!(datagram.payload, b"hi there");
    }

    #[test]
    fn test_time_exceeded_on_last_hop() {
        let (core, sink) = test_core();
        let mut packet = Ipv6Packet::from_bytes(&v6_udp_packet(
            "2001:db8::1",
            1000,
            "64:ff9b::c0a8:201",
            2000,
            b"x",
        ))
        .unwrap();
        packet.hop_limit = 1;

        assert_eq!(core.process(&packet.to_bytes()), Verdict::Drop);
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let reply = parse_v6(&sent[0]);
        assert_eq!(reply.destination_address, v6("2001:db8::1"));
        let message = Icmpv6Message::from_bytes(&reply.payload).unwrap();
        assert_eq!(message.icmp_type, Icmpv6Types::TimeExceeded);
    }
}
