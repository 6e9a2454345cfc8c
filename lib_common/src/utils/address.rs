/// Normalizes a device network address into its map key form.
///
/// Addresses are compared case-insensitively and without surrounding
/// whitespace. Empty or placeholder values are passed through untouched
/// (after trimming) so the caller decides what to do with them.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Builds the synthetic address given to a feed entry that arrived without one.
pub fn fallback_address(index: usize) -> String {
    format!("unknown-{}", index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_and_lowercases() {
        assert_eq!(normalize_address("  10.0.0.1 "), "10.0.0.1");
        assert_eq!(normalize_address("Miner-A.LOCAL"), "miner-a.local");
        assert_eq!(normalize_address("FE80::1"), "fe80::1");
    }

    #[test]
    fn test_normalize_keeps_placeholders() {
        assert_eq!(normalize_address(""), "");
        assert_eq!(normalize_address("   "), "");
        assert_eq!(normalize_address("N/A"), "n/a");
    }

    #[test]
    fn test_fallback_address_is_indexed() {
        assert_eq!(fallback_address(0), "unknown-0");
        assert_eq!(fallback_address(7), "unknown-7");
    }
}
