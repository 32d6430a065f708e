//! Binding and session tracking for a stateful NAT64 (RFC6146).
//!
//! This crate holds the translator's long-lived state: the Binding
//! Information Base, the per-flow session tables with their expiry queues,
//! the IPv4 transport-address pool, and the queue of IPv4 SYN packets held
//! back while waiting for a simultaneous open. The packet pipeline itself
//! lives in the `statemask` crate; everything here is plain data structures
//! guarded by the caller's mutexes.

#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod bib;
pub mod error;
pub mod expirer;
pub mod pktqueue;
pub mod pool4;
pub mod session;
pub mod tuple;

pub use bib::{Bib, BibEntry, BibId};
pub use error::Error;
pub use expirer::{ExpireEvent, ExpireList, Ttls};
pub use pktqueue::PktQueue;
pub use pool4::Pool4;
pub use session::{Pair4, Pair6, Session, SessionId, SessionTable, TcpState};
pub use tuple::{L4Proto, Transport4, Transport6, Tuple, Tuple4, Tuple6};
