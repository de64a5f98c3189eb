use super::{PipelinePerformanceOptions, ShutdownReport, TickPipeline, tick_channel};
use crate::{
    config::{RuntimeConfig, SharedConfig},
    storage::Storage,
    tick::Tick,
};
use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SYMBOLS: [&str; 8] = [
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT", "BNBUSDT", "AVAXUSDT",
];

/// End-to-end throughput of one synthetic load run, persistence included.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BenchmarkReport {
    pub sources: usize,
    pub ticks_sent: u64,
    pub elapsed: Duration,
    pub ticks_per_second: f64,
    pub shutdown: ShutdownReport,
}

/// Drive `ticks_per_source` synthetic ticks from each of `sources` concurrent producers
/// through a pipeline built with `options`, then shut it down and measure.
pub async fn run_synthetic_load(
    options: PipelinePerformanceOptions,
    storage: Arc<dyn Storage>,
    sources: usize,
    ticks_per_source: usize,
) -> BenchmarkReport {
    let config = Arc::new(SharedConfig::new(RuntimeConfig::new(SYMBOLS, Vec::new())));
    let (tx, rx) = tick_channel(options.lane_capacity.saturating_mul(options.partition_count));
    let cancel = CancellationToken::new();
    let partition_count = options.partition_count;
    let batch_size = options.batch_size;

    let pipeline = TickPipeline::new(config, storage)
        .with_options(options)
        .start(rx, cancel);

    let started = Instant::now();
    let base = Utc::now();

    let producers = (0..sources).map(|source| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let feed = format!("synthetic-{source}");
            for sequence in 0..ticks_per_source {
                let tick = Tick::new(
                    feed.as_str(),
                    SYMBOLS[sequence % SYMBOLS.len()],
                    Decimal::from(100 + (sequence % 50) as u64),
                    Decimal::ONE,
                    base + TimeDelta::milliseconds(sequence as i64),
                )
                .with_trade_id(format!("{source}-{sequence}"));

                if tx.send(tick).await.is_err() {
                    break;
                }
            }
        })
    });
    join_all(producers).await;
    drop(tx);

    let shutdown = pipeline.shutdown().await;
    let elapsed = started.elapsed();
    let ticks_per_second = shutdown.processed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    info!(
        sources,
        partition_count,
        batch_size,
        ticks = shutdown.processed,
        elapsed_ms = elapsed.as_millis() as u64,
        ticks_per_second,
        "synthetic load finished"
    );

    BenchmarkReport {
        sources,
        ticks_sent: shutdown.accepted,
        elapsed,
        ticks_per_second,
        shutdown,
    }
}
