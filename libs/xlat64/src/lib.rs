//! Packet translation between IPv4 and IPv6 for a stateful NAT64.
//!
//! This crate owns stage four of the pipeline: given a parsed packet and
//! the translated transport addresses the session database decided on, it
//! synthesizes the other family's headers, maps ICMP types and codes,
//! recursively translates the packets quoted inside ICMP errors, and
//! splits oversized IPv4 datagrams into IPv6 fragment chains. It knows
//! nothing about sessions; callers feed it addresses.

#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub mod icmp_error;
pub mod options;
pub mod protocols;
pub mod xlat;

pub use error::{Error, Result};
pub use options::TranslateOptions;
