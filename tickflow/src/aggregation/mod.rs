use crate::tick::NormalizedTick;
use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::time::Duration;

pub use candle::{AggregatedCandle, CandleBuilder};
pub use metrics::{MetricsBuilder, MetricsSnapshot};

/// Time-aligned OHLCV candle building.
pub mod candle;

/// Sliding-window price & volume statistics.
pub mod metrics;

/// Default candle window sizes: 1m, 5m & 1h.
pub const DEFAULT_CANDLE_WINDOWS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(3_600),
];

/// Default rolling metrics window.
pub const DEFAULT_METRICS_WINDOW: Duration = Duration::from_secs(60);

/// Result of applying one tick to an [`AggregationEngine`].
#[derive(Clone, PartialEq, Debug)]
pub struct AggregationOutput {
    /// Candles frozen by this tick, at most one per window size.
    pub closed_candles: Vec<AggregatedCandle>,
    pub metrics: MetricsSnapshot,
}

/// Candle builders for every configured window plus a rolling metrics builder, for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolAggregator {
    candles: Vec<CandleBuilder>,
    metrics: MetricsBuilder,
}

impl SymbolAggregator {
    pub fn new(candle_windows: &[Duration], metrics_window: Duration) -> Self {
        Self {
            candles: candle_windows.iter().copied().map(CandleBuilder::new).collect(),
            metrics: MetricsBuilder::new(metrics_window),
        }
    }

    pub fn apply(&mut self, tick: &NormalizedTick) -> AggregationOutput {
        let closed_candles = self
            .candles
            .iter_mut()
            .filter_map(|builder| builder.update(tick))
            .collect();

        AggregationOutput {
            closed_candles,
            metrics: self.metrics.update(tick),
        }
    }

    pub fn candle_builders(&self) -> &[CandleBuilder] {
        &self.candles
    }

    fn take_open_candles(&mut self) -> impl Iterator<Item = AggregatedCandle> + '_ {
        self.candles.iter_mut().filter_map(CandleBuilder::take_open)
    }
}

/// Per-lane aggregation state. Owned exclusively by one lane task, so never locked.
///
/// A [`SymbolAggregator`] is created lazily the first time a symbol is seen.
#[derive(Debug, Clone)]
pub struct AggregationEngine {
    candle_windows: Vec<Duration>,
    metrics_window: Duration,
    symbols: FnvHashMap<SmolStr, SymbolAggregator>,
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CANDLE_WINDOWS.to_vec(), DEFAULT_METRICS_WINDOW)
    }
}

impl AggregationEngine {
    pub fn new(candle_windows: Vec<Duration>, metrics_window: Duration) -> Self {
        Self {
            candle_windows,
            metrics_window,
            symbols: FnvHashMap::default(),
        }
    }

    pub fn apply(&mut self, tick: &NormalizedTick) -> AggregationOutput {
        let key = if tick.symbol.chars().any(|c| c.is_ascii_lowercase()) {
            SmolStr::new(tick.symbol.to_uppercase())
        } else {
            tick.symbol.clone()
        };

        let Self {
            candle_windows,
            metrics_window,
            symbols,
        } = self;

        symbols
            .entry(key)
            .or_insert_with(|| SymbolAggregator::new(candle_windows, *metrics_window))
            .apply(tick)
    }

    /// Take every in-flight candle so it can be persisted at shutdown. Flushed candles are
    /// marked `is_closed = false`.
    pub fn flush_open_candles(&mut self) -> Vec<AggregatedCandle> {
        self.symbols
            .values_mut()
            .flat_map(SymbolAggregator::take_open_candles)
            .collect()
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolAggregator> {
        self.symbols.get(&SmolStr::new(symbol.to_uppercase()))
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::Tick;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, min: u32, sec: u32) -> NormalizedTick {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, min, sec).unwrap();
        NormalizedTick::from(Tick::new("binance", symbol, dec!(100), dec!(1), timestamp))
    }

    #[test]
    fn test_engine_closes_only_elapsed_windows() {
        let mut engine = AggregationEngine::default();

        assert!(engine.apply(&tick("BTCUSDT", 0, 10)).closed_candles.is_empty());

        // 1m window rolls, 5m & 1h do not
        let output = engine.apply(&tick("BTCUSDT", 1, 0));
        assert_eq!(output.closed_candles.len(), 1);
        assert_eq!(output.closed_candles[0].window, Duration::from_secs(60));

        // 1m and 5m both roll
        let output = engine.apply(&tick("BTCUSDT", 5, 0));
        let windows = output
            .closed_candles
            .iter()
            .map(|candle| candle.window)
            .collect::<Vec<_>>();
        assert_eq!(windows, vec![Duration::from_secs(60), Duration::from_secs(300)]);
        // 12:00:10 and 12:01:00 fell out of the trailing minute
        assert_eq!(output.metrics.count, 1);
    }

    #[test]
    fn test_engine_symbols_are_independent() {
        let mut engine = AggregationEngine::default();

        engine.apply(&tick("BTCUSDT", 0, 10));
        let output = engine.apply(&tick("ETHUSDT", 3, 0));

        assert!(output.closed_candles.is_empty());
        assert_eq!(output.metrics.count, 1);
        assert_eq!(engine.symbol_count(), 2);
    }

    #[test]
    fn test_flush_open_candles() {
        let mut engine = AggregationEngine::new(
            vec![Duration::from_secs(60), Duration::from_secs(300)],
            DEFAULT_METRICS_WINDOW,
        );
        engine.apply(&tick("BTCUSDT", 0, 10));
        engine.apply(&tick("ETHUSDT", 0, 20));

        let flushed = engine.flush_open_candles();
        assert_eq!(flushed.len(), 4);
        assert!(flushed.iter().all(|candle| !candle.is_closed));
        assert!(engine.flush_open_candles().is_empty());
    }
}
