use crate::tick::NormalizedTick;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// OHLCV candle over one aligned time window.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct AggregatedCandle {
    pub source: SmolStr,
    pub symbol: SmolStr,
    pub window_start: DateTime<Utc>,
    #[serde(with = "crate::config::duration_ms", rename = "window_ms")]
    pub window: Duration,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub count: u64,
    /// `false` for an in-flight candle flushed at shutdown.
    pub is_closed: bool,
}

impl AggregatedCandle {
    fn seed(tick: &NormalizedTick, window: Duration, window_start: DateTime<Utc>) -> Self {
        Self {
            source: tick.source.clone(),
            symbol: tick.symbol.clone(),
            window_start,
            window,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            count: 1,
            is_closed: false,
        }
    }

    fn update(&mut self, tick: &NormalizedTick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
        self.count += 1;
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + TimeDelta::from_std(self.window).unwrap_or(TimeDelta::zero())
    }
}

/// Builds consecutive candles of one window size for one symbol.
///
/// Window boundaries are derived from tick timestamps, not the wall clock. Windows only ever
/// advance: a tick whose aligned window is older than the active one is folded into the
/// active candle rather than reopening a closed window.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    window: Duration,
    window_ms: i64,
    current: Option<AggregatedCandle>,
}

impl CandleBuilder {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_ms: (window.as_millis() as i64).max(1),
            current: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Align a timestamp down to the start of its window.
    pub fn align(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let millis = timestamp.timestamp_millis();
        let aligned = millis - millis.rem_euclid(self.window_ms);
        DateTime::from_timestamp_millis(aligned).unwrap_or(timestamp)
    }

    /// Apply a tick, returning the frozen previous candle when the tick opens a newer window.
    pub fn update(&mut self, tick: &NormalizedTick) -> Option<AggregatedCandle> {
        let aligned = self.align(tick.timestamp);

        match self.current.as_mut() {
            None => {
                self.current = Some(AggregatedCandle::seed(tick, self.window, aligned));
                None
            }
            Some(current) if aligned > current.window_start => {
                let mut closed = std::mem::replace(
                    current,
                    AggregatedCandle::seed(tick, self.window, aligned),
                );
                closed.is_closed = true;
                Some(closed)
            }
            Some(current) => {
                current.update(tick);
                None
            }
        }
    }

    pub fn current(&self) -> Option<&AggregatedCandle> {
        self.current.as_ref()
    }

    /// Take the in-flight candle, leaving the builder empty.
    pub fn take_open(&mut self) -> Option<AggregatedCandle> {
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::Tick;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn tick(hour: u32, min: u32, sec: u32, price: Decimal, volume: Decimal) -> NormalizedTick {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, hour, min, sec).unwrap();
        NormalizedTick::from(Tick::new("binance", "BTCUSDT", price, volume, timestamp))
    }

    #[test]
    fn test_candle_rollover() {
        let mut builder = CandleBuilder::new(Duration::from_secs(60));

        assert!(builder.update(&tick(12, 0, 10, dec!(100), dec!(1))).is_none());
        assert!(builder.update(&tick(12, 0, 50, dec!(110), dec!(2))).is_none());

        let closed = builder
            .update(&tick(12, 1, 5, dec!(105), dec!(3)))
            .expect("candle should close on next window");

        assert_eq!(closed.window_start, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        assert_eq!(closed.open, dec!(100));
        assert_eq!(closed.high, dec!(110));
        assert_eq!(closed.low, dec!(100));
        assert_eq!(closed.close, dec!(110));
        assert_eq!(closed.volume, dec!(3));
        assert_eq!(closed.count, 2);
        assert!(closed.is_closed);

        let current = builder.current().unwrap();
        assert_eq!(current.window_start, Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
        assert_eq!(current.open, dec!(105));
        assert!(!current.is_closed);
    }

    #[test]
    fn test_late_tick_folds_into_active_candle() {
        let mut builder = CandleBuilder::new(Duration::from_secs(60));

        builder.update(&tick(12, 0, 10, dec!(100), dec!(1)));
        assert!(builder.update(&tick(12, 1, 0, dec!(101), dec!(1))).is_some());

        // 12:00:59 belongs to the closed window, which is never reopened
        assert!(builder.update(&tick(12, 0, 59, dec!(90), dec!(1))).is_none());

        let current = builder.current().unwrap();
        assert_eq!(current.window_start, Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
        assert_eq!(current.low, dec!(90));
        assert_eq!(current.count, 2);
    }

    #[test]
    fn test_align() {
        struct TestCase {
            window: Duration,
            input: DateTime<Utc>,
            expected: DateTime<Utc>,
        }

        let tests = vec![
            TestCase {
                // TC0: 1m window
                window: Duration::from_secs(60),
                input: Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 59).unwrap(),
                expected: Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 0).unwrap(),
            },
            TestCase {
                // TC1: 5m window
                window: Duration::from_secs(300),
                input: Utc.with_ymd_and_hms(2024, 5, 1, 12, 9, 1).unwrap(),
                expected: Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap(),
            },
            TestCase {
                // TC2: 1h window, exactly on boundary
                window: Duration::from_secs(3600),
                input: Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
                expected: Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let builder = CandleBuilder::new(test.window);
            assert_eq!(builder.align(test.input), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_take_open() {
        let mut builder = CandleBuilder::new(Duration::from_secs(300));
        builder.update(&tick(12, 0, 10, dec!(100), dec!(1)));

        let open = builder.take_open().unwrap();
        assert!(!open.is_closed);
        assert!(builder.current().is_none());
        assert!(builder.take_open().is_none());
    }
}
