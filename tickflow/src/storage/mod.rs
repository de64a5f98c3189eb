use crate::{
    aggregation::{AggregatedCandle, MetricsSnapshot},
    alerting::Alert,
    error::StorageError,
    tick::{NormalizedTick, Tick},
};
use async_trait::async_trait;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

pub use memory::{InMemoryStorage, WriteLogEntry};
pub use writer::{BufferedStorageWriter, StorageWriterHandle, StorageWriterStats};

/// [`Storage`] backed by process memory, with idempotent upserts & an ordered write log.
pub mod memory;

/// Bounded, batching writer decoupling the lanes from [`Storage`] latency.
pub mod writer;

/// Persistence collaborator. Every write is a batch and must tolerate duplicates
/// idempotently, since a restart or a partially failed flush may re-deliver records.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn write_raw_ticks(&self, ticks: &[Tick]) -> Result<(), StorageError>;

    async fn write_normalized_ticks(&self, ticks: &[NormalizedTick]) -> Result<(), StorageError>;

    async fn write_candles(&self, candles: &[AggregatedCandle]) -> Result<(), StorageError>;

    async fn write_metrics(&self, metrics: &[MetricsSnapshot]) -> Result<(), StorageError>;

    async fn write_alert(&self, alert: &Alert) -> Result<(), StorageError>;
}

/// Record queued on the [`BufferedStorageWriter`].
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize, From)]
pub enum StorageRecord {
    RawTick(Tick),
    NormalizedTick(NormalizedTick),
    Candle(AggregatedCandle),
    Metrics(MetricsSnapshot),
}

/// Kind of record, used to group a flush into per-kind batch writes.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum RecordKind {
    #[display("raw_tick")]
    RawTick,
    #[display("normalized_tick")]
    NormalizedTick,
    #[display("candle")]
    Candle,
    #[display("metrics")]
    Metrics,
    #[display("alert")]
    Alert,
}

impl StorageRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            StorageRecord::RawTick(_) => RecordKind::RawTick,
            StorageRecord::NormalizedTick(_) => RecordKind::NormalizedTick,
            StorageRecord::Candle(_) => RecordKind::Candle,
            StorageRecord::Metrics(_) => RecordKind::Metrics,
        }
    }
}
