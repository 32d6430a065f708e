//! Request handlers for each mode × operation pair the protocol permits.

use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use stateful_nat::{BibId, L4Proto, SessionId, TcpState, Transport4, Transport6};

use super::codec::{CodecError, Reader, Writer};
use super::{Mode, Operation, Response};
use crate::config::RuntimeConfig;
use crate::pipeline::Nat64;

/// Entries per DISPLAY chunk; the client pages with the iterate flag
const DISPLAY_CHUNK: usize = 64;

pub fn handle(core: &Nat64, mode: Mode, operation: Operation, payload: &[u8]) -> Response {
    let result = match (mode, operation) {
        (Mode::Pool6, Operation::Display) => pool6_display(core, payload),
        (Mode::Pool6, Operation::Count) => pool6_count(core, payload),
        (Mode::Pool6, Operation::Add) => pool6_add(core, payload),
        (Mode::Pool6, Operation::Remove) => pool6_remove(core, payload),
        (Mode::Pool6, Operation::Flush) => pool6_flush(core, payload),
        (Mode::Pool4, Operation::Display) => pool4_display(core, payload),
        (Mode::Pool4, Operation::Count) => pool4_count(core, payload),
        (Mode::Pool4, Operation::Add) => pool4_add(core, payload),
        (Mode::Pool4, Operation::Remove) => pool4_remove(core, payload),
        (Mode::Pool4, Operation::Flush) => pool4_flush(core, payload),
        (Mode::Bib, Operation::Display) => bib_display(core, payload),
        (Mode::Bib, Operation::Count) => bib_count(core, payload),
        (Mode::Bib, Operation::Add) => bib_add(core, payload),
        (Mode::Bib, Operation::Remove) => bib_remove(core, payload),
        (Mode::Session, Operation::Display) => session_display(core, payload),
        (Mode::Session, Operation::Count) => session_count(core, payload),
        (Mode::General, Operation::Display) => general_display(core, payload),
        (Mode::General, Operation::Update) => general_update(core, payload),
        _ => return Response::bad_request("operation not permitted for this mode"),
    };
    result.unwrap_or_else(|error| Response::bad_request(&error.to_string()))
}

fn parse_l4(value: u8) -> Option<L4Proto> {
    match value {
        0 => Some(L4Proto::Udp),
        1 => Some(L4Proto::Tcp),
        2 => Some(L4Proto::Icmp),
        _ => None,
    }
}

fn state_to_wire(state: TcpState) -> u8 {
    match state {
        TcpState::Closed => 0,
        TcpState::V4Init => 1,
        TcpState::V6Init => 2,
        TcpState::Established => 3,
        TcpState::V4FinRcv => 4,
        TcpState::V6FinRcv => 5,
        TcpState::V4FinV6FinRcv => 6,
        TcpState::Trans => 7,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------- pool6

fn pool6_display(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    Reader::new(payload).finish()?;
    let pool6 = core.pool6.lock().unwrap().clone();
    let mut writer = Writer::new();
    writer.u32(u32::try_from(pool6.len()).unwrap_or(u32::MAX));
    for prefix in pool6.iter() {
        writer.ipv6(prefix.addr());
        writer.u8(prefix.prefix_len());
    }
    Ok(Response::ok(writer.into_vec()))
}

fn pool6_count(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    Reader::new(payload).finish()?;
    let mut writer = Writer::new();
    writer.u64(core.pool6.lock().unwrap().len() as u64);
    Ok(Response::ok(writer.into_vec()))
}

fn pool6_add(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let addr = reader.ipv6()?;
    let length = reader.u8()?;
    reader.finish()?;

    let Ok(prefix) = Ipv6Net::new(addr, length) else {
        return Ok(Response::rejected("invalid prefix length"));
    };
    match core.pool6.lock().unwrap().add(prefix) {
        Ok(()) => Ok(Response::ok(Vec::new())),
        Err(error) => Ok(Response::rejected(&error.to_string())),
    }
}

fn pool6_remove(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let addr = reader.ipv6()?;
    let length = reader.u8()?;
    reader.finish()?;

    let Ok(prefix) = Ipv6Net::new(addr, length) else {
        return Ok(Response::rejected("invalid prefix length"));
    };
    if let Err(error) = core.pool6.lock().unwrap().remove(&prefix) {
        return Ok(Response::rejected(&error.to_string()));
    }
    // Sessions synthesized out of the prefix are now unroutable
    core.cascade_delete(|table| table.delete_by_v6_prefix(&prefix));
    Ok(Response::ok(Vec::new()))
}

fn pool6_flush(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    Reader::new(payload).finish()?;
    core.pool6.lock().unwrap().flush();
    core.cascade_delete(stateful_nat::SessionTable::flush);
    Ok(Response::ok(Vec::new()))
}

// ---------------------------------------------------------------- pool4

fn pool4_display(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    Reader::new(payload).finish()?;
    let mut writer = Writer::new();
    let pool4 = core.pool4.lock().unwrap();
    writer.u32(u32::try_from(pool4.len()).unwrap_or(u32::MAX));
    for addr in pool4.iter() {
        writer.ipv4(addr);
    }
    Ok(Response::ok(writer.into_vec()))
}

fn pool4_count(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    Reader::new(payload).finish()?;
    let mut writer = Writer::new();
    writer.u64(core.pool4.lock().unwrap().len() as u64);
    Ok(Response::ok(writer.into_vec()))
}

fn pool4_add(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let addr = reader.ipv4()?;
    let length = reader.u8()?;
    reader.finish()?;

    let Ok(net) = Ipv4Net::new(addr, length) else {
        return Ok(Response::rejected("invalid prefix length"));
    };
    match core.pool4.lock().unwrap().add_net(net) {
        Ok(()) => Ok(Response::ok(Vec::new())),
        Err(error) => Ok(Response::rejected(&error.to_string())),
    }
}

fn pool4_remove(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let addr = reader.ipv4()?;
    reader.finish()?;

    if !core.pool4.lock().unwrap().contains(addr) {
        return Ok(Response::rejected("address is not in the pool"));
    }

    // Flows masked behind the address die first, then any static
    // bindings still pinning it
    core.cascade_delete(|table| table.delete_by_v4(addr));
    for l4 in L4Proto::ALL {
        let mut bib = core.bib(l4).lock().unwrap();
        let doomed: Vec<BibId> = bib
            .iter_from(None)
            .filter(|(_, entry)| entry.addr4.addr == addr)
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            let _ = bib.remove(id);
        }
    }
    match core.pool4.lock().unwrap().remove(addr) {
        Ok(()) => Ok(Response::ok(Vec::new())),
        Err(error) => Ok(Response::rejected(&error.to_string())),
    }
}

fn pool4_flush(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    Reader::new(payload).finish()?;
    core.cascade_delete(stateful_nat::SessionTable::flush);
    for l4 in L4Proto::ALL {
        let mut bib = core.bib(l4).lock().unwrap();
        let doomed: Vec<BibId> = bib.iter_from(None).map(|(id, _)| id).collect();
        for id in doomed {
            let _ = bib.remove(id);
        }
    }
    core.pool4.lock().unwrap().flush();
    Ok(Response::ok(Vec::new()))
}

// ------------------------------------------------------------------ bib

fn bib_display(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let Some(l4) = parse_l4(reader.u8()?) else {
        return Ok(Response::rejected("unknown protocol"));
    };
    let iterate = reader.bool()?;
    let cursor_addr = reader.ipv4()?;
    let cursor_port = reader.u16()?;
    reader.finish()?;

    let cursor = iterate.then_some(Transport4::new(cursor_addr, cursor_port));

    let bib = core.bib(l4).lock().unwrap();
    let entries: Vec<_> = bib
        .iter_from(cursor)
        .take(DISPLAY_CHUNK + 1)
        .map(|(_, entry)| entry.clone())
        .collect();
    let more = entries.len() > DISPLAY_CHUNK;

    let mut writer = Writer::new();
    let shown = &entries[..entries.len().min(DISPLAY_CHUNK)];
    writer.u32(u32::try_from(shown.len()).unwrap_or(u32::MAX));
    for entry in shown {
        writer.ipv6(entry.addr6.addr);
        writer.u16(entry.addr6.id);
        writer.ipv4(entry.addr4.addr);
        writer.u16(entry.addr4.id);
        writer.bool(entry.is_static);
    }
    Ok(Response::ok_more(writer.into_vec(), more))
}

fn bib_count(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let Some(l4) = parse_l4(reader.u8()?) else {
        return Ok(Response::rejected("unknown protocol"));
    };
    reader.finish()?;
    let mut writer = Writer::new();
    writer.u64(core.bib(l4).lock().unwrap().len() as u64);
    Ok(Response::ok(writer.into_vec()))
}

fn bib_add(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let Some(l4) = parse_l4(reader.u8()?) else {
        return Ok(Response::rejected("unknown protocol"));
    };
    let addr6 = Transport6::new(reader.ipv6()?, reader.u16()?);
    let addr4 = Transport4::new(reader.ipv4()?, reader.u16()?);
    reader.finish()?;

    match core.add_static_binding(l4, addr6, addr4) {
        Ok(()) => Ok(Response::ok(Vec::new())),
        Err(error) => Ok(Response::rejected(&error.to_string())),
    }
}

fn bib_remove(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let Some(l4) = parse_l4(reader.u8()?) else {
        return Ok(Response::rejected("unknown protocol"));
    };
    let addr6 = Transport6::new(reader.ipv6()?, reader.u16()?);
    reader.finish()?;

    let mut release = None;
    let mut dead_sessions: Vec<SessionId> = Vec::new();
    {
        let mut bib = core.bib(l4).lock().unwrap();
        let mut sessions = core.sessions(l4).lock().unwrap();
        let Some((id, _)) = bib.get_by_6(addr6) else {
            return Ok(Response::rejected("no such binding"));
        };
        for (session_id, _) in sessions.delete_by_bib(id) {
            dead_sessions.push(session_id);
        }
        if let Ok(entry) = bib.remove(id) {
            release = Some(entry.addr4);
        }
    }
    if let Some(transport) = release {
        core.pool4
            .lock()
            .unwrap()
            .release(transport.addr, transport.id, l4);
    }
    let mut pktqueue = core.pktqueue.lock().unwrap();
    for id in dead_sessions {
        pktqueue.remove(id);
    }
    Ok(Response::ok(Vec::new()))
}

// -------------------------------------------------------------- session

fn session_display(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let Some(l4) = parse_l4(reader.u8()?) else {
        return Ok(Response::rejected("unknown protocol"));
    };
    let iterate = reader.bool()?;
    let local = Transport4::new(reader.ipv4()?, reader.u16()?);
    let remote = Transport4::new(reader.ipv4()?, reader.u16()?);
    reader.finish()?;

    let cursor = iterate.then_some((local, remote));

    let sessions = core.sessions(l4).lock().unwrap();
    let entries: Vec<_> = sessions
        .iter_from(cursor)
        .take(DISPLAY_CHUNK + 1)
        .map(|(_, session)| session.clone())
        .collect();
    let more = entries.len() > DISPLAY_CHUNK;

    let mut writer = Writer::new();
    let shown = &entries[..entries.len().min(DISPLAY_CHUNK)];
    writer.u32(u32::try_from(shown.len()).unwrap_or(u32::MAX));
    for session in shown {
        writer.ipv6(session.pair6.remote.addr);
        writer.u16(session.pair6.remote.id);
        writer.ipv6(session.pair6.local.addr);
        writer.u16(session.pair6.local.id);
        writer.ipv4(session.pair4.local.addr);
        writer.u16(session.pair4.local.id);
        writer.ipv4(session.pair4.remote.addr);
        writer.u16(session.pair4.remote.id);
        writer.u8(state_to_wire(session.state));
    }
    Ok(Response::ok_more(writer.into_vec(), more))
}

fn session_count(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let Some(l4) = parse_l4(reader.u8()?) else {
        return Ok(Response::rejected("unknown protocol"));
    };
    reader.finish()?;
    let mut writer = Writer::new();
    writer.u64(core.sessions(l4).lock().unwrap().count() as u64);
    Ok(Response::ok(writer.into_vec()))
}

// -------------------------------------------------------------- general

fn general_display(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    Reader::new(payload).finish()?;
    let config = core.config.load();

    let mut writer = Writer::new();
    writer.u64(duration_ms(config.sessiondb.udp_ttl));
    writer.u64(duration_ms(config.sessiondb.icmp_ttl));
    writer.u64(duration_ms(config.sessiondb.tcp_est_ttl));
    writer.u64(duration_ms(config.sessiondb.tcp_trans_ttl));
    writer.u64(config.pktqueue.max_pkts as u64);
    writer.bool(config.filtering.drop_by_addr);
    writer.bool(config.filtering.drop_icmp6_info);
    writer.bool(config.filtering.drop_external_tcp);
    writer.bool(config.translate.reset_traffic_class);
    writer.bool(config.translate.reset_tos);
    writer.u8(config.translate.new_tos);
    writer.bool(config.translate.df_always_on);
    writer.bool(config.translate.build_ipv4_id);
    writer.bool(config.translate.lower_mtu_fail);
    writer.u16(config.translate.min_ipv6_mtu);
    writer.u16(u16::try_from(config.translate.mtu_plateaus.len()).unwrap_or(u16::MAX));
    writer.u64(duration_ms(config.fragmentation.fragment_timeout));
    // The plateau array rides behind the fixed portion
    for plateau in &config.translate.mtu_plateaus {
        writer.u16(*plateau);
    }
    Ok(Response::ok(writer.into_vec()))
}

fn general_update(core: &Nat64, payload: &[u8]) -> Result<Response, CodecError> {
    let mut reader = Reader::new(payload);
    let mut candidate = RuntimeConfig::default();

    candidate.sessiondb.udp_ttl = Duration::from_millis(reader.u64()?);
    candidate.sessiondb.icmp_ttl = Duration::from_millis(reader.u64()?);
    candidate.sessiondb.tcp_est_ttl = Duration::from_millis(reader.u64()?);
    candidate.sessiondb.tcp_trans_ttl = Duration::from_millis(reader.u64()?);
    candidate.pktqueue.max_pkts = usize::try_from(reader.u64()?).unwrap_or(usize::MAX);
    candidate.filtering.drop_by_addr = reader.bool()?;
    candidate.filtering.drop_icmp6_info = reader.bool()?;
    candidate.filtering.drop_external_tcp = reader.bool()?;
    candidate.translate.reset_traffic_class = reader.bool()?;
    candidate.translate.reset_tos = reader.bool()?;
    candidate.translate.new_tos = reader.u8()?;
    candidate.translate.df_always_on = reader.bool()?;
    candidate.translate.build_ipv4_id = reader.bool()?;
    candidate.translate.lower_mtu_fail = reader.bool()?;
    candidate.translate.min_ipv6_mtu = reader.u16()?;
    let plateau_count = reader.u16()?;
    candidate.fragmentation.fragment_timeout = Duration::from_millis(reader.u64()?);
    let mut plateaus = Vec::with_capacity(usize::from(plateau_count));
    for _ in 0..plateau_count {
        plateaus.push(reader.u16()?);
    }
    candidate.translate.mtu_plateaus = plateaus;
    reader.finish()?;

    // A snapshot that fails validation never reaches the datapath
    if let Err(error) = candidate.validate() {
        return Ok(Response::rejected(&error.to_string()));
    }

    core.pktqueue
        .lock()
        .unwrap()
        .set_max_pkts(candidate.pktqueue.max_pkts);
    core.config.store(std::sync::Arc::new(candidate));
    // Shorter lifetimes may make the current expiry nap overshoot
    core.wake_expirer();
    Ok(Response::ok(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Nat64, PacketSink};
    use rfc6052::Pool6;
    use stateful_nat::Pool4;
    use std::sync::Arc;

    struct NullSink;

    impl PacketSink for NullSink {
        fn send(&self, _packet: &[u8]) {}
    }

    fn test_core() -> Nat64 {
        let mut pool6 = Pool6::new();
        pool6.add("64:ff9b::/96".parse().unwrap()).unwrap();
        let mut pool4 = Pool4::new();
        pool4.add("192.0.2.1".parse().unwrap()).unwrap();
        Nat64::new(
            pool6,
            pool4,
            crate::config::RuntimeConfig::default(),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn test_forbidden_combinations() {
        let core = test_core();
        // Sessions are read-only through the control channel
        assert_eq!(handle(&core, Mode::Session, Operation::Add, &[]).code, 1);
        assert_eq!(handle(&core, Mode::Session, Operation::Flush, &[]).code, 1);
        assert_eq!(handle(&core, Mode::General, Operation::Remove, &[]).code, 1);
        assert_eq!(handle(&core, Mode::Bib, Operation::Flush, &[]).code, 1);
    }

    #[test]
    fn test_pool6_display_lists_prefixes() {
        let core = test_core();
        let response = handle(&core, Mode::Pool6, Operation::Display, &[]);
        assert_eq!(response.code, 0);
        let mut reader = Reader::new(&response.payload);
        assert_eq!(reader.u32().unwrap(), 1);
        assert_eq!(
            reader.ipv6().unwrap(),
            "64:ff9b::".parse::<std::net::Ipv6Addr>().unwrap()
        );
        assert_eq!(reader.u8().unwrap(), 96);
        reader.finish().unwrap();
    }

    #[test]
    fn test_bib_add_count_display() {
        let core = test_core();

        let mut request = Writer::new();
        request.u8(1); // TCP
        request.ipv6("2001:db8::1".parse().unwrap());
        request.u16(80);
        request.ipv4("192.0.2.1".parse().unwrap());
        request.u16(8080);
        let response = handle(&core, Mode::Bib, Operation::Add, &request.into_vec());
        assert_eq!(response.code, 0);

        let mut request = Writer::new();
        request.u8(1);
        let response = handle(&core, Mode::Bib, Operation::Count, &request.into_vec());
        let mut reader = Reader::new(&response.payload);
        assert_eq!(reader.u64().unwrap(), 1);

        // First page, no cursor
        let mut request = Writer::new();
        request.u8(1);
        request.bool(false);
        request.ipv4(std::net::Ipv4Addr::UNSPECIFIED);
        request.u16(0);
        let response = handle(&core, Mode::Bib, Operation::Display, &request.into_vec());
        assert_eq!(response.code, 0);
        assert!(!response.more);
        let mut reader = Reader::new(&response.payload);
        assert_eq!(reader.u32().unwrap(), 1);
        assert_eq!(
            reader.ipv6().unwrap(),
            "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap()
        );
        assert_eq!(reader.u16().unwrap(), 80);
        assert_eq!(
            reader.ipv4().unwrap(),
            "192.0.2.1".parse::<std::net::Ipv4Addr>().unwrap()
        );
        assert_eq!(reader.u16().unwrap(), 8080);
        assert!(reader.bool().unwrap());
        reader.finish().unwrap();
    }

    #[test]
    fn test_general_display_update_round_trip() {
        let core = test_core();
        let display = handle(&core, Mode::General, Operation::Display, &[]);
        assert_eq!(display.code, 0);

        // Feeding the snapshot straight back is a valid update
        let update = handle(&core, Mode::General, Operation::Update, &display.payload);
        assert_eq!(update.code, 0);
    }

    #[test]
    fn test_invalid_update_leaves_config_alone() {
        let core = test_core();
        let mut display = handle(&core, Mode::General, Operation::Display, &[]).payload;
        // Stomp the UDP lifetime below its floor
        display[..8].copy_from_slice(&1000u64.to_le_bytes());
        let update = handle(&core, Mode::General, Operation::Update, &display);
        assert_eq!(update.code, 2);
        assert_eq!(
            core.config.load().sessiondb.udp_ttl,
            std::time::Duration::from_secs(300)
        );
    }

    #[test]
    fn test_session_count_empty() {
        let core = test_core();
        let mut request = Writer::new();
        request.u8(0);
        let response = handle(&core, Mode::Session, Operation::Count, &request.into_vec());
        assert_eq!(response.code, 0);
        let mut reader = Reader::new(&response.payload);
        assert_eq!(reader.u64().unwrap(), 0);
    }
}
