//! Tunables that shape header synthesis.

/// Knobs controlling how the translators fill in the fields that have no
/// direct counterpart in the other family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateOptions {
    /// Zero the IPv6 traffic class instead of copying the IPv4 TOS
    pub reset_traffic_class: bool,
    /// Use `new_tos` for the IPv4 TOS instead of copying the traffic class
    pub reset_tos: bool,
    /// The TOS value used when `reset_tos` is on
    pub new_tos: u8,
    /// Set Don't-Fragment on every synthesized IPv4 header
    pub df_always_on: bool,
    /// Derive an IPv4 identification for unfragmented IPv6 packets instead
    /// of zeroing it
    pub build_ipv4_id: bool,
    /// Raise Packet-Too-Big MTUs below 1280 up to 1280 when translating
    /// IPv4 Fragmentation-Needed errors
    pub lower_mtu_fail: bool,
    /// Plateau table for synthesizing a path MTU when a router reports none
    pub mtu_plateaus: Vec<u16>,
    /// Upper bound on the size of any IPv6 packet this translator emits
    pub min_ipv6_mtu: u16,
}

/// The classic plateau table from RFC1191 section 7.1
pub const DEFAULT_MTU_PLATEAUS: [u16; 11] = [
    65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296, 68,
];

impl Default for TranslateOptions {
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

impl TranslateOptions {
    /// Largest plateau strictly below `total_length`, used when an IPv4
    /// router reported Fragmentation Needed without filling in the MTU
    #[must_use]
    pub fn plateau_for(&self, total_length: u16) -> u16 {
        self.mtu_plateaus
            .iter()
            .copied()
            .find(|plateau| *plateau < total_length)
            .unwrap_or_else(|| self.mtu_plateaus.last().copied().unwrap_or(68))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plateau_lookup() {
        let opts = TranslateOptions::default();
        assert_eq!(opts.plateau_for(1500), 1492);
        assert_eq!(opts.plateau_for(1492), 1006);
        assert_eq!(opts.plateau_for(100), 68);
        // Nothing is below the smallest plateau; fall back to it
        assert_eq!(opts.plateau_for(68), 68);
    }
}
