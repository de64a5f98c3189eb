//! Per-lane tick conditioning: normalize → allow-list filter → fingerprint TTL dedup.
//!
//! A [`TickConditioner`] is exclusively owned by one pipeline lane, so its dedup store needs no
//! locking. The symbol allow-list is read through the shared [`ConfigProvider`] on every call.

use crate::{
    config::ConfigProvider,
    tick::{NormalizedTick, Tick},
};
use chrono::Utc;
use derive_more::Display;
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::trace;

/// Default fingerprint time-to-live.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

/// Default minimum spacing between lazy dedup cleanups.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Reason a tick did not survive conditioning.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Rejection {
    InvalidPrice,
    InvalidVolume,
    SymbolNotAllowed,
    Duplicate,
}

/// Lifetime counters of one [`TickConditioner`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConditionerStats {
    pub accepted: u64,
    pub invalid_price: u64,
    pub invalid_volume: u64,
    pub symbol_not_allowed: u64,
    pub duplicates: u64,
}

impl ConditionerStats {
    pub fn rejected(&self) -> u64 {
        self.invalid_price + self.invalid_volume + self.symbol_not_allowed + self.duplicates
    }

    pub fn merge(&mut self, other: &ConditionerStats) {
        self.accepted += other.accepted;
        self.invalid_price += other.invalid_price;
        self.invalid_volume += other.invalid_volume;
        self.symbol_not_allowed += other.symbol_not_allowed;
        self.duplicates += other.duplicates;
    }

    fn record(&mut self, outcome: Result<(), Rejection>) {
        match outcome {
            Ok(()) => self.accepted += 1,
            Err(Rejection::InvalidPrice) => self.invalid_price += 1,
            Err(Rejection::InvalidVolume) => self.invalid_volume += 1,
            Err(Rejection::SymbolNotAllowed) => self.symbol_not_allowed += 1,
            Err(Rejection::Duplicate) => self.duplicates += 1,
        }
    }
}

pub struct TickConditioner {
    config: Arc<dyn ConfigProvider>,
    ttl_secs: i64,
    cleanup_interval_secs: i64,
    seen: FnvHashMap<String, i64>,
    expiry: VecDeque<(String, i64)>,
    last_cleanup_secs: i64,
    stats: ConditionerStats,
}

impl std::fmt::Debug for TickConditioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickConditioner")
            .field("ttl_secs", &self.ttl_secs)
            .field("cleanup_interval_secs", &self.cleanup_interval_secs)
            .field("tracked", &self.seen.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl TickConditioner {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self::with_ttl(config, DEFAULT_DEDUP_TTL, DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_ttl(
        config: Arc<dyn ConfigProvider>,
        ttl: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            config,
            ttl_secs: ttl.as_secs() as i64,
            cleanup_interval_secs: cleanup_interval.as_secs() as i64,
            seen: FnvHashMap::default(),
            expiry: VecDeque::new(),
            last_cleanup_secs: i64::MIN,
            stats: ConditionerStats::default(),
        }
    }

    /// Attach the dedup fingerprint.
    pub fn normalize(&self, tick: Tick) -> NormalizedTick {
        NormalizedTick::from(tick)
    }

    /// Returns `true` if the tick has a positive price & volume and an allowed symbol.
    pub fn filter(&self, tick: &NormalizedTick) -> bool {
        self.check(tick).is_ok()
    }

    fn check(&self, tick: &NormalizedTick) -> Result<(), Rejection> {
        if tick.price <= Decimal::ZERO {
            return Err(Rejection::InvalidPrice);
        }
        if tick.volume <= Decimal::ZERO {
            return Err(Rejection::InvalidVolume);
        }
        if !self.config.snapshot().is_symbol_allowed(&tick.symbol) {
            return Err(Rejection::SymbolNotAllowed);
        }
        Ok(())
    }

    /// Returns `true` if the fingerprint was already seen within the TTL. A first sighting is
    /// recorded and returns `false`.
    pub fn is_duplicate(&mut self, tick: &NormalizedTick) -> bool {
        self.is_duplicate_at(tick, Utc::now().timestamp())
    }

    pub fn is_duplicate_at(&mut self, tick: &NormalizedTick, now_secs: i64) -> bool {
        self.cleanup(now_secs);

        if let Some(seen_secs) = self.seen.get(&tick.fingerprint) {
            if now_secs - seen_secs < self.ttl_secs {
                return true;
            }
        }

        // Expired entries awaiting cleanup are refreshed: the stale queue entry is then skipped
        // by cleanup because the map no longer holds its seen-time.
        self.seen.insert(tick.fingerprint.clone(), now_secs);
        self.expiry.push_back((tick.fingerprint.clone(), now_secs));
        false
    }

    /// Run normalize → filter → deduplicate.
    pub fn condition(&mut self, tick: Tick) -> Result<NormalizedTick, Rejection> {
        self.condition_at(tick, Utc::now().timestamp())
    }

    pub fn condition_at(&mut self, tick: Tick, now_secs: i64) -> Result<NormalizedTick, Rejection> {
        let tick = self.normalize(tick);

        let outcome = self.check(&tick).and_then(|()| {
            if self.is_duplicate_at(&tick, now_secs) {
                Err(Rejection::Duplicate)
            } else {
                Ok(())
            }
        });

        self.stats.record(outcome);

        match outcome {
            Ok(()) => Ok(tick),
            Err(rejection) => {
                trace!(
                    source = %tick.source,
                    symbol = %tick.symbol,
                    fingerprint = %tick.fingerprint,
                    %rejection,
                    "tick rejected by conditioner"
                );
                Err(rejection)
            }
        }
    }

    pub fn stats(&self) -> ConditionerStats {
        self.stats
    }

    /// Number of fingerprints currently held by the dedup store.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    fn cleanup(&mut self, now_secs: i64) {
        if now_secs.saturating_sub(self.last_cleanup_secs) < self.cleanup_interval_secs {
            return;
        }
        self.last_cleanup_secs = now_secs;

        while let Some((_, seen_secs)) = self.expiry.front() {
            if now_secs - seen_secs < self.ttl_secs {
                break;
            }

            if let Some((fingerprint, seen_secs)) = self.expiry.pop_front() {
                if self.seen.get(&fingerprint) == Some(&seen_secs) {
                    self.seen.remove(&fingerprint);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, SharedConfig};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn conditioner(symbols: &[&str]) -> TickConditioner {
        let config = SharedConfig::new(RuntimeConfig::new(symbols.iter(), Vec::new()));
        TickConditioner::new(Arc::new(config))
    }

    fn tick(symbol: &str, price: Decimal, volume: Decimal) -> Tick {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        Tick::new("binance", symbol, price, volume, timestamp)
    }

    #[test]
    fn test_filter() {
        struct TestCase {
            input: Tick,
            expected: bool,
        }

        let conditioner = conditioner(&["BTCUSDT"]);

        let tests = vec![
            TestCase {
                // TC0: valid & allowed
                input: tick("BTCUSDT", dec!(100), dec!(1)),
                expected: true,
            },
            TestCase {
                // TC1: allow-list lookup is case-insensitive
                input: tick("btcusdt", dec!(100), dec!(1)),
                expected: true,
            },
            TestCase {
                // TC2: zero price
                input: tick("BTCUSDT", dec!(0), dec!(1)),
                expected: false,
            },
            TestCase {
                // TC3: zero volume
                input: tick("BTCUSDT", dec!(100), dec!(0)),
                expected: false,
            },
            TestCase {
                // TC4: negative price
                input: tick("BTCUSDT", dec!(-1), dec!(1)),
                expected: false,
            },
            TestCase {
                // TC5: symbol not allowed
                input: tick("DOGEUSDT", dec!(100), dec!(1)),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let normalized = conditioner.normalize(test.input);
            assert_eq!(conditioner.filter(&normalized), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_is_duplicate_same_tick_twice() {
        let mut conditioner = conditioner(&["BTCUSDT"]);
        let normalized = conditioner.normalize(tick("BTCUSDT", dec!(100), dec!(1)));

        assert!(!conditioner.is_duplicate_at(&normalized, 1_000));
        assert!(conditioner.is_duplicate_at(&normalized, 1_001));
    }

    #[test]
    fn test_is_duplicate_expires_after_ttl() {
        let mut conditioner = conditioner(&["BTCUSDT"]);
        let normalized = conditioner.normalize(tick("BTCUSDT", dec!(100), dec!(1)));

        assert!(!conditioner.is_duplicate_at(&normalized, 1_000));
        assert!(conditioner.is_duplicate_at(&normalized, 1_299));
        assert!(!conditioner.is_duplicate_at(&normalized, 1_300));
    }

    #[test]
    fn test_cleanup_keeps_refreshed_fingerprint() {
        let config = SharedConfig::new(RuntimeConfig::new(["BTCUSDT"], Vec::new()));
        let mut conditioner = TickConditioner::with_ttl(
            Arc::new(config),
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let normalized = conditioner.normalize(tick("BTCUSDT", dec!(100), dec!(1)));

        // First sighting at t=0 also performs the initial cleanup
        assert!(!conditioner.is_duplicate_at(&normalized, 0));

        // Expired but not yet cleaned up (cleanup interval not elapsed): refreshed at t=20
        assert!(!conditioner.is_duplicate_at(&normalized, 20));

        // Cleanup at t=60 pops the stale (t=0) entry but must keep the refreshed one, and then
        // the (t=20) entry is itself expired and removed
        let other = conditioner.normalize(tick("BTCUSDT", dec!(101), dec!(1)));
        assert!(!conditioner.is_duplicate_at(&other, 25));
        assert!(conditioner.is_duplicate_at(&normalized, 25));

        assert!(!conditioner.is_duplicate_at(&other, 60));
        assert_eq!(conditioner.tracked(), 1);
    }

    #[test]
    fn test_condition_counts_rejections() {
        let mut conditioner = conditioner(&["BTCUSDT", "ETHUSDT"]);

        let outcomes = vec![
            conditioner.condition_at(tick("BTCUSDT", dec!(100), dec!(1)), 10),
            conditioner.condition_at(tick("BTCUSDT", dec!(100), dec!(1)), 11),
            conditioner.condition_at(tick("ETHUSDT", dec!(0), dec!(1)), 12),
            conditioner.condition_at(tick("ETHUSDT", dec!(1), dec!(0)), 13),
            conditioner.condition_at(tick("XRPUSDT", dec!(1), dec!(1)), 14),
        ];

        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1], Err(Rejection::Duplicate));
        assert_eq!(outcomes[2], Err(Rejection::InvalidPrice));
        assert_eq!(outcomes[3], Err(Rejection::InvalidVolume));
        assert_eq!(outcomes[4], Err(Rejection::SymbolNotAllowed));

        let stats = conditioner.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected(), 4);
    }

    #[test]
    fn test_filter_reads_runtime_config_changes() {
        let config = Arc::new(SharedConfig::new(RuntimeConfig::new(["BTCUSDT"], Vec::new())));
        let conditioner = TickConditioner::new(config.clone());
        let normalized = conditioner.normalize(tick("SOLUSDT", dec!(150), dec!(3)));

        assert!(!conditioner.filter(&normalized));
        config.allow_symbol("solusdt");
        assert!(conditioner.filter(&normalized));
    }
}
