//! RFC6052 IPv4-Embedded IPv6 address translation and the translation-prefix
//! pool used to decide which IPv6 destinations are ours to translate.

#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;

mod addr;
mod pool;

pub use addr::{addr_4to6, addr_6to4};
pub use pool::Pool6;

/// All allowed translation prefix lengths according to [RFC6052 Section 2.2](https://datatracker.ietf.org/doc/html/rfc6052#section-2.2)
pub const ALLOWED_PREFIX_LENS: [u8; 6] = [32, 40, 48, 56, 64, 96];

/// The Well-Known Prefix, used as the default pool6 entry
pub const WELL_KNOWN_PREFIX: &str = "64:ff9b::/96";
