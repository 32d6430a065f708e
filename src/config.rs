//! Configuration: the immutable runtime snapshot the datapath reads, and
//! the TOML file the daemon boots from.
//!
//! The live configuration is never mutated. Readers grab the current
//! `Arc` out of an [`arc_swap::ArcSwap`]; writers build a new snapshot,
//! validate it, and swap it in whole. A rejected snapshot leaves the live
//! one untouched.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use stateful_nat::{L4Proto, Ttls};
use xlat64::options::{TranslateOptions, DEFAULT_MTU_PLATEAUS};

/// How long an unanswered IPv4 SYN may sit in the pending queue
pub const TCP_INCOMING_SYN: Duration = Duration::from_secs(6);

/// Floors enforced on timer updates, from RFC6146 section 4
const UDP_TTL_FLOOR: Duration = Duration::from_secs(2 * 60);
const TCP_EST_TTL_FLOOR: Duration = Duration::from_secs(2 * 60 * 60);
const TCP_TRANS_TTL_FLOOR: Duration = Duration::from_secs(4 * 60);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("UDP session lifetime must be at least 120 seconds")]
    UdpTtlTooLow,
    #[error("Established TCP session lifetime must be at least 2 hours")]
    TcpEstTtlTooLow,
    #[error("Transitory TCP session lifetime must be at least 4 minutes")]
    TcpTransTtlTooLow,
    #[error("The MTU plateau list may not be empty")]
    EmptyPlateaus,
    #[error("MTU plateaus may not be zero")]
    ZeroPlateau,
    #[error("The minimum IPv6 MTU may not be below 1280")]
    MtuTooLow,
}

/// Session database timers, in milliseconds on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDbConfig {
    pub udp_ttl: Duration,
    pub icmp_ttl: Duration,
    pub tcp_est_ttl: Duration,
    pub tcp_trans_ttl: Duration,
}

impl Default for SessionDbConfig {
    fn default() -> Self {
        Self {
            udp_ttl: Duration::from_secs(5 * 60),
            icmp_ttl: Duration::from_secs(60),
            tcp_est_ttl: Duration::from_secs(2 * 60 * 60),
            tcp_trans_ttl: Duration::from_secs(4 * 60),
        }
    }
}

/// Pending-SYN queue sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktQueueConfig {
    pub max_pkts: usize,
}

impl Default for PktQueueConfig {
    fn default() -> Self {
        Self { max_pkts: 16 }
    }
}

/// Filtering policies
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilteringConfig {
    /// Address-dependent filtering: only IPv4 nodes a session already
    /// talks to may send through an existing binding
    pub drop_by_addr: bool,
    /// Drop ICMPv6 echo traffic instead of translating it
    pub drop_icmp6_info: bool,
    /// Refuse externally initiated TCP (no V4 INIT sessions)
    pub drop_external_tcp: bool,
}

/// Header synthesis tunables, mirrored into [`TranslateOptions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateConfig {
    pub reset_traffic_class: bool,
    pub reset_tos: bool,
    pub new_tos: u8,
    pub df_always_on: bool,
    pub build_ipv4_id: bool,
    pub lower_mtu_fail: bool,
    pub mtu_plateaus: Vec<u16>,
    pub min_ipv6_mtu: u16,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            reset_traffic_class: false,
            reset_tos: false,
            new_tos: 0,
            df_always_on: true,
            build_ipv4_id: true,
            lower_mtu_fail: true,
            mtu_plateaus: DEFAULT_MTU_PLATEAUS.to_vec(),
            min_ipv6_mtu: 1280,
        }
    }
}

impl TranslateConfig {
    /// The options struct the translator consumes
    #[must_use]
    pub fn to_options(&self) -> TranslateOptions {
        TranslateOptions {
            reset_traffic_class: self.reset_traffic_class,
            reset_tos: self.reset_tos,
            new_tos: self.new_tos,
            df_always_on: self.df_always_on,
            build_ipv4_id: self.build_ipv4_id,
            lower_mtu_fail: self.lower_mtu_fail,
            mtu_plateaus: self.mtu_plateaus.clone(),
            min_ipv6_mtu: self.min_ipv6_mtu,
        }
    }
}

/// Fragment bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentationConfig {
    pub fragment_timeout: Duration,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            fragment_timeout: Duration::from_secs(2),
        }
    }
}

/// The immutable runtime snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    pub sessiondb: SessionDbConfig,
    pub pktqueue: PktQueueConfig,
    pub filtering: FilteringConfig,
    pub translate: TranslateConfig,
    pub fragmentation: FragmentationConfig,
}

impl RuntimeConfig {
    /// Validate a candidate snapshot before it may replace the live one.
    ///
    /// The ICMP lifetime deliberately has no floor; operators get to dig
    /// that hole for themselves.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.sessiondb.udp_ttl < UDP_TTL_FLOOR {
            return Err(ConfigError::UdpTtlTooLow);
        }
        if self.sessiondb.tcp_est_ttl < TCP_EST_TTL_FLOOR {
            return Err(ConfigError::TcpEstTtlTooLow);
        }
        if self.sessiondb.tcp_trans_ttl < TCP_TRANS_TTL_FLOOR {
            return Err(ConfigError::TcpTransTtlTooLow);
        }
        if self.translate.mtu_plateaus.is_empty() {
            return Err(ConfigError::EmptyPlateaus);
        }
        if self.translate.mtu_plateaus.contains(&0) {
            return Err(ConfigError::ZeroPlateau);
        }
        if self.translate.min_ipv6_mtu < 1280 {
            return Err(ConfigError::MtuTooLow);
        }

        // Normalize the plateau list: descending and unique
        self.translate.mtu_plateaus.sort_unstable_by(|a, b| b.cmp(a));
        self.translate.mtu_plateaus.dedup();
        Ok(())
    }

    /// The expiry TTL set the session tables consume
    #[must_use]
    pub fn ttls(&self) -> Ttls {
        Ttls {
            udp: self.sessiondb.udp_ttl,
            icmp: self.sessiondb.icmp_ttl,
            tcp_est: self.sessiondb.tcp_est_ttl,
            tcp_trans: self.sessiondb.tcp_trans_ttl,
            syn: TCP_INCOMING_SYN,
        }
    }
}

/// A static binding declared in the config file
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StaticBibRule {
    /// IPv6 address of the node
    pub v6: Ipv6Addr,
    /// IPv6-side port (or ICMP identifier)
    pub v6_port: u16,
    /// Pool address to pin
    pub v4: Ipv4Addr,
    /// IPv4-side port (or ICMP identifier)
    pub v4_port: u16,
    /// One of "udp", "tcp", "icmp"
    pub protocol: String,
}

impl StaticBibRule {
    /// The protocol table this rule belongs to
    #[must_use]
    pub fn l4(&self) -> Option<L4Proto> {
        match self.protocol.to_ascii_lowercase().as_str() {
            "udp" => Some(L4Proto::Udp),
            "tcp" => Some(L4Proto::Tcp),
            "icmp" => Some(L4Proto::Icmp),
            _ => None,
        }
    }
}

fn default_pool6() -> Vec<Ipv6Net> {
    vec![rfc6052::WELL_KNOWN_PREFIX.parse().unwrap()]
}

fn default_control_socket() -> String {
    "/run/statemask.sock".to_string()
}

/// Representation of the `statemask.toml` config file
#[derive(Debug, serde::Deserialize)]
pub struct Config {
    /// RFC6052 translation prefixes, most preferred first
    #[serde(rename = "Pool6", default = "default_pool6")]
    pub pool6: Vec<Ipv6Net>,
    /// IPv4 prefixes to masquerade behind
    #[serde(rename = "Pool4")]
    pub pool4: Vec<Ipv4Net>,
    /// Static bindings
    #[serde(rename = "Static", default = "Vec::new")]
    pub static_bib: Vec<StaticBibRule>,
    /// Address to bind to for prometheus support
    #[serde(rename = "Prometheus")]
    pub prom_bind_addr: Option<SocketAddr>,
    /// Where the control socket listens
    #[serde(rename = "ControlSocket", default = "default_control_socket")]
    pub control_socket: String,
    /// UDP session lifetime override, in seconds
    #[serde(rename = "UdpLifetime")]
    pub udp_lifetime: Option<u64>,
    /// ICMP session lifetime override, in seconds
    #[serde(rename = "IcmpLifetime")]
    pub icmp_lifetime: Option<u64>,
    /// Established TCP lifetime override, in seconds
    #[serde(rename = "TcpEstLifetime")]
    pub tcp_est_lifetime: Option<u64>,
    /// Transitory TCP lifetime override, in seconds
    #[serde(rename = "TcpTransLifetime")]
    pub tcp_trans_lifetime: Option<u64>,
}

impl Config {
    /// Load the config from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let file_contents = std::fs::read_to_string(path)?;
        let deserializer = toml::Deserializer::new(&file_contents);
        match serde_path_to_error::deserialize(deserializer) {
            Ok(config) => Ok(config),
            // If there is a parsing error, display a reasonable error message
            Err(e) => {
                eprintln!(
                    "Failed to parse config file due to:\n {}\n at {}",
                    e.inner().message(),
                    e.path()
                );
                std::process::exit(1);
            }
        }
    }

    /// Build the initial runtime snapshot from the file's overrides
    pub fn runtime(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut runtime = RuntimeConfig::default();
        if let Some(seconds) = self.udp_lifetime {
            runtime.sessiondb.udp_ttl = Duration::from_secs(seconds);
        }
        if let Some(seconds) = self.icmp_lifetime {
            runtime.sessiondb.icmp_ttl = Duration::from_secs(seconds);
        }
        if let Some(seconds) = self.tcp_est_lifetime {
            runtime.sessiondb.tcp_est_ttl = Duration::from_secs(seconds);
        }
        if let Some(seconds) = self.tcp_trans_lifetime {
            runtime.sessiondb.tcp_trans_ttl = Duration::from_secs(seconds);
        }
        runtime.validate()?;
        Ok(runtime)
    }
}
