use fnv::FnvHasher;
use std::hash::Hasher;

/// Deterministic, case-insensitive symbol partition in `0..partition_count`.
///
/// Uses FNV over the upper-cased symbol bytes so the assignment is stable across processes
/// and restarts, unlike the randomly seeded std hasher.
pub fn partition_for(symbol: &str, partition_count: usize) -> usize {
    if partition_count <= 1 {
        return 0;
    }

    let mut hasher = FnvHasher::default();
    for byte in symbol.trim().bytes() {
        hasher.write_u8(byte.to_ascii_uppercase());
    }

    (hasher.finish() % partition_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_for_is_case_insensitive_and_stable() {
        for symbol in ["BTCUSDT", "ethusdt", "SolUsdt", "XRPUSDT"] {
            let upper = partition_for(&symbol.to_uppercase(), 8);
            assert_eq!(partition_for(symbol, 8), upper);
            assert_eq!(partition_for(&symbol.to_lowercase(), 8), upper);
            assert!(upper < 8);
        }
    }

    #[test]
    fn test_single_partition() {
        assert_eq!(partition_for("BTCUSDT", 1), 0);
        assert_eq!(partition_for("BTCUSDT", 0), 0);
    }

    #[test]
    fn test_partitions_spread_symbols() {
        let used = (0..64)
            .map(|index| partition_for(&format!("SYM{index}USDT"), 4))
            .collect::<std::collections::HashSet<_>>();

        assert_eq!(used.len(), 4);
    }
}
