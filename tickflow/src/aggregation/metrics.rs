use crate::tick::NormalizedTick;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::VecDeque, time::Duration};

/// Rolling statistics over the trailing time window ending at the latest tick.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MetricsSnapshot {
    pub source: SmolStr,
    pub symbol: SmolStr,
    pub window_start: DateTime<Utc>,
    #[serde(with = "crate::config::duration_ms", rename = "window_ms")]
    pub window: Duration,
    pub timestamp: DateTime<Utc>,
    pub average_price: Decimal,
    /// Population standard deviation of price.
    pub volatility: Decimal,
    pub count: u64,
    pub average_volume: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: DateTime<Utc>,
    price: Decimal,
    volume: Decimal,
}

/// Sliding-window price and volume statistics for one symbol.
#[derive(Debug, Clone)]
pub struct MetricsBuilder {
    window: Duration,
    window_delta: TimeDelta,
    samples: VecDeque<Sample>,
}

impl MetricsBuilder {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_delta: TimeDelta::from_std(window).unwrap_or(TimeDelta::minutes(1)),
            samples: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Insert the tick, evict samples older than `tick.timestamp - window` and recompute.
    pub fn update(&mut self, tick: &NormalizedTick) -> MetricsSnapshot {
        let sample = Sample {
            timestamp: tick.timestamp,
            price: tick.price,
            volume: tick.volume,
        };

        // Keep the queue time ordered even if a tick arrives late
        let position = self
            .samples
            .partition_point(|existing| existing.timestamp <= sample.timestamp);
        self.samples.insert(position, sample);

        let window_start = tick.timestamp - self.window_delta;
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < window_start)
        {
            self.samples.pop_front();
        }

        let count = Decimal::from(self.samples.len());
        let (price_sum, volume_sum) = self
            .samples
            .iter()
            .fold((Decimal::ZERO, Decimal::ZERO), |(price, volume), sample| {
                (
                    price.saturating_add(sample.price),
                    volume.saturating_add(sample.volume),
                )
            });

        let average_price = price_sum / count;
        let average_volume = volume_sum / count;

        // Saturate rather than overflow on extreme prices
        let variance = self
            .samples
            .iter()
            .map(|sample| {
                let deviation = sample.price - average_price;
                deviation.saturating_mul(deviation)
            })
            .fold(Decimal::ZERO, Decimal::saturating_add)
            / count;

        MetricsSnapshot {
            source: tick.source.clone(),
            symbol: tick.symbol.clone(),
            window_start,
            window: self.window,
            timestamp: tick.timestamp,
            average_price,
            volatility: variance.sqrt().unwrap_or(Decimal::ZERO),
            count: self.samples.len() as u64,
            average_volume,
        }
    }
}
