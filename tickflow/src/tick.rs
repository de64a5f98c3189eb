use crate::fingerprint::fingerprint;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Raw trade tick as emitted by an ingestion source.
///
/// `source` identifies the exchange, so every transport of one exchange (WebSocket stream,
/// REST poller) produces identical fingerprints for the same trade. `feed` identifies the
/// ingestion adapter that delivered it and is what health monitoring tracks.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Tick {
    pub source: SmolStr,
    pub feed: SmolStr,
    pub symbol: SmolStr,
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub trade_id: Option<SmolStr>,
}

impl Tick {
    pub fn new<S, Sym>(
        source: S,
        symbol: Sym,
        price: Decimal,
        volume: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self
    where
        S: Into<SmolStr>,
        Sym: Into<SmolStr>,
    {
        let source = source.into();
        Self {
            feed: source.clone(),
            source,
            symbol: symbol.into(),
            price,
            volume,
            timestamp,
            received_at: Utc::now(),
            trade_id: None,
        }
    }

    pub fn with_trade_id(mut self, trade_id: impl Into<SmolStr>) -> Self {
        self.trade_id = Some(trade_id.into());
        self
    }

    pub fn with_feed(mut self, feed: impl Into<SmolStr>) -> Self {
        self.feed = feed.into();
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Exchange-to-local delay in milliseconds, clamped at zero for skewed exchange clocks.
    pub fn delay_ms(&self) -> u64 {
        (self.received_at - self.timestamp)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// [`Tick`] carrying its dedup fingerprint, with symbol upper-cased.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct NormalizedTick {
    pub source: SmolStr,
    pub feed: SmolStr,
    pub symbol: SmolStr,
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub trade_id: Option<SmolStr>,
    pub fingerprint: String,
}

impl NormalizedTick {
    pub fn delay_ms(&self) -> u64 {
        (self.received_at - self.timestamp)
            .num_milliseconds()
            .max(0) as u64
    }
}

impl From<Tick> for NormalizedTick {
    fn from(tick: Tick) -> Self {
        let Tick {
            source,
            feed,
            symbol,
            price,
            volume,
            timestamp,
            received_at,
            trade_id,
        } = tick;

        let fingerprint = fingerprint(
            &source,
            &symbol,
            timestamp,
            price,
            volume,
            trade_id.as_deref(),
        );

        Self {
            source,
            feed,
            symbol: SmolStr::new(symbol.trim().to_uppercase()),
            price,
            volume,
            timestamp,
            received_at,
            trade_id,
            fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalized_tick_from_tick() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let tick = Tick::new("binance", "btcusdt", dec!(64000.5), dec!(0.25), timestamp)
            .with_feed("binance-rest")
            .with_trade_id("9001");

        let normalized = NormalizedTick::from(tick);

        assert_eq!(normalized.symbol, "BTCUSDT");
        assert_eq!(normalized.feed, "binance-rest");
        assert_eq!(normalized.fingerprint, "binance:BTCUSDT:id:9001");
    }

    #[test]
    fn test_tick_delay_ms() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let tick = Tick::new("okx", "ETHUSDT", dec!(1), dec!(1), timestamp)
            .with_received_at(timestamp + Duration::milliseconds(250));
        assert_eq!(tick.delay_ms(), 250);

        // Exchange clock ahead of local clock
        let skewed = tick.with_received_at(timestamp - Duration::milliseconds(40));
        assert_eq!(skewed.delay_ms(), 0);
    }
}
