use super::{Storage, StorageRecord};
use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifetime counters of a [`BufferedStorageWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageWriterStats {
    pub enqueued: u64,
    pub flushed_records: u64,
    pub flushed_batches: u64,
    pub failed_batches: u64,
    pub failed_records: u64,
    /// Records still buffered or queued when a hard stop interrupted the writer.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct WriterCounters {
    enqueued: AtomicU64,
    flushed_records: AtomicU64,
    flushed_batches: AtomicU64,
    failed_batches: AtomicU64,
    failed_records: AtomicU64,
    abandoned: AtomicU64,
}

impl WriterCounters {
    fn snapshot(&self) -> StorageWriterStats {
        StorageWriterStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            flushed_records: self.flushed_records.load(Ordering::Relaxed),
            flushed_batches: self.flushed_batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            failed_records: self.failed_records.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn record_result(&self, records: usize, result: Result<(), StorageError>, kind: &str) {
        match result {
            Ok(()) => {
                self.flushed_batches.fetch_add(1, Ordering::Relaxed);
                self.flushed_records
                    .fetch_add(records as u64, Ordering::Relaxed);
            }
            Err(error) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.failed_records
                    .fetch_add(records as u64, Ordering::Relaxed);
                error!(
                    %kind,
                    records,
                    transient = error.is_transient(),
                    ?error,
                    "storage flush failed, batch dropped"
                );
            }
        }
    }
}

/// Cloneable producer side of a [`BufferedStorageWriter`], held by each lane.
#[derive(Debug, Clone)]
pub struct StorageWriterHandle {
    tx: mpsc::Sender<StorageRecord>,
    counters: Arc<WriterCounters>,
}

impl StorageWriterHandle {
    /// Enqueue a record, waiting for capacity when the writer queue is full.
    pub async fn enqueue(&self, record: impl Into<StorageRecord>) -> Result<(), StorageError> {
        self.tx
            .send(record.into())
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> StorageWriterStats {
        self.counters.snapshot()
    }
}

/// Background task batching [`StorageRecord`]s into [`Storage`] writes.
///
/// The task races queue readiness against a periodic flush timer. A flush happens when
/// `batch_size` records are buffered or `flush_interval` elapses, whichever comes first. A
/// failed flush is logged and counted, and the batch is not retried.
#[derive(Debug)]
pub struct BufferedStorageWriter {
    handle: StorageWriterHandle,
    task: JoinHandle<()>,
}

impl BufferedStorageWriter {
    /// Spawn the writer task. `hard_stop` abandons buffered records instead of flushing them.
    pub fn spawn(
        storage: Arc<dyn Storage>,
        capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
        hard_stop: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(WriterCounters::default());

        let task = tokio::spawn(
            WriterTask {
                storage,
                rx,
                batch_size: batch_size.max(1),
                flush_interval,
                counters: Arc::clone(&counters),
                hard_stop,
            }
            .run(),
        );

        Self {
            handle: StorageWriterHandle { tx, counters },
            task,
        }
    }

    pub fn handle(&self) -> StorageWriterHandle {
        self.handle.clone()
    }

    pub async fn enqueue(&self, record: impl Into<StorageRecord>) -> Result<(), StorageError> {
        self.handle.enqueue(record).await
    }

    pub fn stats(&self) -> StorageWriterStats {
        self.handle.stats()
    }

    /// Stop accepting records once every [`StorageWriterHandle`] is dropped, drain the queue,
    /// perform a final flush and return the lifetime stats.
    pub async fn close(self) -> StorageWriterStats {
        let Self { handle, task } = self;
        let counters = Arc::clone(&handle.counters);
        drop(handle);

        if let Err(error) = task.await {
            error!(?error, "storage writer task failed");
        }

        counters.snapshot()
    }
}

struct WriterTask {
    storage: Arc<dyn Storage>,
    rx: mpsc::Receiver<StorageRecord>,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<WriterCounters>,
    hard_stop: CancellationToken,
}

impl WriterTask {
    async fn run(mut self) {
        let mut buffer = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.hard_stop.cancelled() => {
                    self.abandon(buffer.len());
                    return;
                }

                record = self.rx.recv() => match record {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= self.batch_size {
                            if !self.flush(&mut buffer).await {
                                return;
                            }
                            ticker.reset();
                        }
                    }
                    None => {
                        self.flush(&mut buffer).await;
                        debug!("storage writer drained");
                        return;
                    }
                },

                _ = ticker.tick() => {
                    if !buffer.is_empty() && !self.flush(&mut buffer).await {
                        return;
                    }
                }
            }
        }
    }

    /// Flush the buffer grouped by record kind. Returns `false` if interrupted by a hard stop.
    async fn flush(&mut self, buffer: &mut Vec<StorageRecord>) -> bool {
        if buffer.is_empty() {
            return true;
        }

        let batch = std::mem::take(buffer);
        let records = batch.len();

        tokio::select! {
            _ = self.write_batch(batch) => true,
            _ = self.hard_stop.cancelled() => {
                self.abandon(records);
                false
            }
        }
    }

    async fn write_batch(&self, batch: Vec<StorageRecord>) {
        let mut raw = Vec::new();
        let mut normalized = Vec::new();
        let mut candles = Vec::new();
        let mut metrics = Vec::new();

        for record in batch {
            match record {
                StorageRecord::RawTick(tick) => raw.push(tick),
                StorageRecord::NormalizedTick(tick) => normalized.push(tick),
                StorageRecord::Candle(candle) => candles.push(candle),
                StorageRecord::Metrics(snapshot) => metrics.push(snapshot),
            }
        }

        if !raw.is_empty() {
            let result = self.storage.write_raw_ticks(&raw).await;
            self.counters.record_result(raw.len(), result, "raw_tick");
        }
        if !normalized.is_empty() {
            let result = self.storage.write_normalized_ticks(&normalized).await;
            self.counters
                .record_result(normalized.len(), result, "normalized_tick");
        }
        if !candles.is_empty() {
            let result = self.storage.write_candles(&candles).await;
            self.counters.record_result(candles.len(), result, "candle");
        }
        if !metrics.is_empty() {
            let result = self.storage.write_metrics(&metrics).await;
            self.counters.record_result(metrics.len(), result, "metrics");
        }
    }

    fn abandon(&mut self, buffered: usize) {
        self.rx.close();
        let mut queued = 0usize;
        while self.rx.try_recv().is_ok() {
            queued += 1;
        }

        let abandoned = (buffered + queued) as u64;
        self.counters
            .abandoned
            .fetch_add(abandoned, Ordering::Relaxed);

        if abandoned > 0 {
            warn!(abandoned, "storage writer hard stopped with unflushed records");
        } else {
            info!("storage writer hard stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::InMemoryStorage,
        tick::{NormalizedTick, Tick},
    };
    use chrono::{TimeDelta, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn tick(id: i64) -> NormalizedTick {
        let timestamp =
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(id);
        NormalizedTick::from(
            Tick::new("binance", "BTCUSDT", dec!(100), dec!(1), timestamp)
                .with_trade_id(id.to_string()),
        )
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let storage = Arc::new(InMemoryStorage::new());
        let writer = BufferedStorageWriter::spawn(
            storage.clone(),
            16,
            2,
            Duration::from_secs(3_600),
            CancellationToken::new(),
        );

        for id in 0..4 {
            writer.enqueue(tick(id)).await.unwrap();
        }

        let stats = writer.close().await;
        assert_eq!(stats.enqueued, 4);
        assert_eq!(stats.flushed_records, 4);
        assert_eq!(stats.flushed_batches, 2);
        assert_eq!(storage.normalized_ticks().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval() {
        let storage = Arc::new(InMemoryStorage::new());
        let writer = BufferedStorageWriter::spawn(
            storage.clone(),
            16,
            100,
            Duration::from_millis(50),
            CancellationToken::new(),
        );

        writer.enqueue(tick(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(storage.normalized_ticks().len(), 1);
        assert_eq!(writer.stats().flushed_batches, 1);

        writer.close().await;
    }

    #[tokio::test]
    async fn test_failed_flush_counted_not_retried() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.fail_next_writes(1);
        let writer = BufferedStorageWriter::spawn(
            storage.clone(),
            16,
            2,
            Duration::from_secs(3_600),
            CancellationToken::new(),
        );

        for id in 0..3 {
            writer.enqueue(tick(id)).await.unwrap();
        }

        let stats = writer.close().await;
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.failed_records, 2);
        assert_eq!(stats.flushed_records, 1);
        assert_eq!(storage.normalized_ticks().len(), 1);
    }

    #[tokio::test]
    async fn test_hard_stop_abandons_buffer() {
        let storage = Arc::new(InMemoryStorage::new());
        let hard_stop = CancellationToken::new();
        let writer = BufferedStorageWriter::spawn(
            storage.clone(),
            16,
            100,
            Duration::from_secs(3_600),
            hard_stop.clone(),
        );

        for id in 0..3 {
            writer.enqueue(tick(id)).await.unwrap();
        }
        hard_stop.cancel();

        let stats = writer.close().await;
        assert_eq!(stats.abandoned, 3);
        assert_eq!(stats.flushed_records, 0);
        assert!(storage.normalized_ticks().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_hard_stop_fails() {
        let hard_stop = CancellationToken::new();
        let writer = BufferedStorageWriter::spawn(
            Arc::new(InMemoryStorage::new()),
            1,
            1,
            Duration::from_secs(1),
            hard_stop.clone(),
        );
        let handle = writer.handle();

        hard_stop.cancel();
        writer.close().await;

        assert_eq!(handle.enqueue(tick(1)).await, Err(StorageError::WriterClosed));
    }
}
