use super::{RecordKind, Storage};
use crate::{
    aggregation::{AggregatedCandle, MetricsSnapshot},
    alerting::Alert,
    error::StorageError,
    fingerprint::fingerprint,
    tick::{NormalizedTick, Tick},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

/// One successful batch write, in the order writes were applied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WriteLogEntry {
    pub kind: RecordKind,
    pub records: usize,
}

type CandleKey = (SmolStr, u64, DateTime<Utc>);
type MetricsKey = (SmolStr, u64, DateTime<Utc>);
type AlertKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    raw_ticks: IndexMap<String, Tick>,
    normalized_ticks: IndexMap<String, NormalizedTick>,
    candles: IndexMap<CandleKey, AggregatedCandle>,
    metrics: IndexMap<MetricsKey, MetricsSnapshot>,
    alerts: IndexMap<AlertKey, Alert>,
    log: Vec<WriteLogEntry>,
}

/// In-process [`Storage`] keyed on natural keys, so re-delivered records upsert in place.
///
/// Natural keys:
/// - ticks: fingerprint
/// - candles: (symbol, window, window_start)
/// - metrics: (symbol, window, timestamp)
/// - alerts: (rule, tick fingerprint)
///
/// Optional per-write latency and injected failures emulate a remote backend.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
    write_latency: Duration,
    failures_remaining: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` on every write call.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// Fail the next `count` write calls with [`StorageError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn raw_ticks(&self) -> Vec<Tick> {
        self.tables.lock().raw_ticks.values().cloned().collect()
    }

    pub fn normalized_ticks(&self) -> Vec<NormalizedTick> {
        self.tables.lock().normalized_ticks.values().cloned().collect()
    }

    pub fn candles(&self) -> Vec<AggregatedCandle> {
        self.tables.lock().candles.values().cloned().collect()
    }

    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.tables.lock().metrics.values().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.tables.lock().alerts.values().cloned().collect()
    }

    pub fn write_log(&self) -> Vec<WriteLogEntry> {
        self.tables.lock().log.clone()
    }

    async fn begin_write(&self) -> Result<(), StorageError> {
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();

        if injected {
            Err(StorageError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn apply<F>(&self, kind: RecordKind, records: usize, upsert: F)
    where
        F: FnOnce(&mut Tables),
    {
        let mut tables = self.tables.lock();
        upsert(&mut tables);
        tables.log.push(WriteLogEntry { kind, records });
    }
}

fn window_ms(window: Duration) -> u64 {
    window.as_millis() as u64
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn write_raw_ticks(&self, ticks: &[Tick]) -> Result<(), StorageError> {
        self.begin_write().await?;
        self.apply(RecordKind::RawTick, ticks.len(), |tables| {
            for tick in ticks {
                let key = fingerprint(
                    &tick.source,
                    &tick.symbol,
                    tick.timestamp,
                    tick.price,
                    tick.volume,
                    tick.trade_id.as_deref(),
                );
                tables.raw_ticks.insert(key, tick.clone());
            }
        });
        Ok(())
    }

    async fn write_normalized_ticks(&self, ticks: &[NormalizedTick]) -> Result<(), StorageError> {
        self.begin_write().await?;
        self.apply(RecordKind::NormalizedTick, ticks.len(), |tables| {
            for tick in ticks {
                tables
                    .normalized_ticks
                    .insert(tick.fingerprint.clone(), tick.clone());
            }
        });
        Ok(())
    }

    async fn write_candles(&self, candles: &[AggregatedCandle]) -> Result<(), StorageError> {
        self.begin_write().await?;
        self.apply(RecordKind::Candle, candles.len(), |tables| {
            for candle in candles {
                let key = (
                    candle.symbol.clone(),
                    window_ms(candle.window),
                    candle.window_start,
                );
                tables.candles.insert(key, candle.clone());
            }
        });
        Ok(())
    }

    async fn write_metrics(&self, metrics: &[MetricsSnapshot]) -> Result<(), StorageError> {
        self.begin_write().await?;
        self.apply(RecordKind::Metrics, metrics.len(), |tables| {
            for snapshot in metrics {
                let key = (
                    snapshot.symbol.clone(),
                    window_ms(snapshot.window),
                    snapshot.timestamp,
                );
                tables.metrics.insert(key, snapshot.clone());
            }
        });
        Ok(())
    }

    async fn write_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        self.begin_write().await?;
        self.apply(RecordKind::Alert, 1, |tables| {
            let key = (alert.rule.to_string(), alert.fingerprint.clone());
            tables.alerts.insert(key, alert.clone());
        });
        Ok(())
    }
}
