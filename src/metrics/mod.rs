//! Prometheus counters for the datapath.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec,
};

pub mod http;

lazy_static! {
    /// Counter for packet verdicts
    pub static ref PACKET_COUNTER: IntCounterVec = register_int_counter_vec!(
        "statemask_packets",
        "Number of packets processed",
        &["family", "verdict"]
    ).unwrap();

    /// Counter for packets dropped with broken headers
    pub static ref HEADER_ERRORS: IntCounterVec = register_int_counter_vec!(
        "statemask_header_errors",
        "Number of packets dropped for malformed headers",
        &["family"]
    ).unwrap();

    /// Counter for packets dropped carrying untranslatable protocols
    pub static ref UNKNOWN_PROTOS: IntCounterVec = register_int_counter_vec!(
        "statemask_unknown_protos",
        "Number of packets dropped for unsupported transport protocols",
        &["family"]
    ).unwrap();

    /// Counter for ICMP errors this translator originated
    pub static ref ICMP_ERRORS_SENT: IntCounterVec = register_int_counter_vec!(
        "statemask_icmp_errors_sent",
        "Number of ICMP errors originated by the translator",
        &["family"]
    ).unwrap();

    /// Gauge for live sessions per protocol
    pub static ref SESSION_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        "statemask_sessions",
        "Number of live sessions",
        &["protocol"]
    ).unwrap();

    /// Gauge for reserved pool4 ports per protocol
    pub static ref POOL4_PORTS_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        "statemask_pool4_ports_reserved",
        "Number of reserved IPv4 transport addresses",
        &["protocol"]
    ).unwrap();
}

/// Label for IPv4-side traffic
pub const FAMILY_V4: &str = "ipv4";
/// Label for IPv6-side traffic
pub const FAMILY_V6: &str = "ipv6";
