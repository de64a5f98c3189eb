//! Partitioned pipeline orchestration & shutdown accounting.
//!
//! Sources write into a bounded [`tick_channel`]. A dispatcher task dequeues every tick,
//! counts it as consumed, and routes it to the lane owning its symbol's partition, so ticks of
//! one symbol are processed strictly in order while different symbols proceed in parallel.
//!
//! Shutdown is two staged:
//! 1. The cancellation token stops intake, and lanes & the writer drain.
//! 2. If draining exceeds `drain_timeout`, an internal hard stop fires, every blocking point
//!    gives up, and whatever remains is reported as dropped rather than awaited.

use crate::{
    aggregation::{AggregationEngine, DEFAULT_CANDLE_WINDOWS, DEFAULT_METRICS_WINDOW},
    alerting::{AlertingEngine, NotifierRegistry},
    conditioner::{
        ConditionerStats, DEFAULT_CLEANUP_INTERVAL, DEFAULT_DEDUP_TTL, TickConditioner,
    },
    config::{ConfigProvider, PipelineConfig},
    error::{ConfigError, PipelineError},
    monitoring::MonitoringEngine,
    storage::{BufferedStorageWriter, Storage, StorageWriterStats},
    tick::Tick,
};
use futures::future::join_all;
use lane::{Lane, LaneSummary};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use benchmark::{BenchmarkReport, run_synthetic_load};
pub use options::PipelinePerformanceOptions;
pub use partition::partition_for;

/// Synthetic load generation for throughput measurement.
pub mod benchmark;

/// [`PipelinePerformanceOptions`] & presets.
pub mod options;

/// Symbol → lane assignment.
pub mod partition;

mod lane;

#[derive(Debug, Default)]
struct ChannelState {
    accepted: AtomicU64,
}

/// Create the bounded channel sources write ticks into. The [`TickSender`] counts every
/// accepted tick so shutdown can report how many were never consumed.
pub fn tick_channel(capacity: usize) -> (TickSender, TickReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let state = Arc::new(ChannelState::default());

    (
        TickSender {
            tx,
            state: Arc::clone(&state),
        },
        TickReceiver { rx, state },
    )
}

/// Producer side of the pipeline tick channel.
#[derive(Debug, Clone)]
pub struct TickSender {
    tx: mpsc::Sender<Tick>,
    state: Arc<ChannelState>,
}

impl TickSender {
    /// Send a tick, waiting for capacity. Fails with [`PipelineError::Closed`] once the
    /// pipeline began shutting down.
    pub async fn send(&self, tick: Tick) -> Result<(), PipelineError> {
        // Count before the tick becomes visible to the dispatcher, so accepted >= consumed
        self.state.accepted.fetch_add(1, Ordering::SeqCst);

        if self.tx.send(tick).await.is_err() {
            self.state.accepted.fetch_sub(1, Ordering::SeqCst);
            return Err(PipelineError::Closed);
        }

        Ok(())
    }

    pub fn accepted(&self) -> u64 {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the pipeline tick channel, handed to [`TickPipeline::start`].
#[derive(Debug)]
pub struct TickReceiver {
    rx: mpsc::Receiver<Tick>,
    state: Arc<ChannelState>,
}

impl TickReceiver {
    pub fn accepted(&self) -> u64 {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Receive the next tick directly, bypassing a pipeline.
    pub async fn recv(&mut self) -> Option<Tick> {
        self.rx.recv().await
    }
}

/// Live pipeline counters, readable while the pipeline runs.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    consumed: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineCounters {
    /// Ticks dequeued from the source channel, counted before partitioning.
    pub fn consumed_tick_count(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Ticks a lane finished handling, including rejected ones.
    pub fn processed_tick_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Ticks accepted but never consumed, set once shutdown completes.
    pub fn dropped_ticks_on_shutdown(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Final accounting returned by [`PipelineHandle::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShutdownReport {
    pub accepted: u64,
    pub consumed: u64,
    pub processed: u64,
    /// `accepted - consumed`: ticks left in the source channel.
    pub dropped: u64,
    /// `consumed - processed`: ticks dequeued but abandoned inside lanes by the hard stop.
    pub abandoned_in_lanes: u64,
    pub timed_out: bool,
    pub flushed_open_candles: u64,
    pub conditioner: ConditionerStats,
    pub writer: StorageWriterStats,
}

/// Partitioned tick processing pipeline, configured then consumed by [`TickPipeline::start`].
pub struct TickPipeline {
    options: PipelinePerformanceOptions,
    candle_windows: Vec<Duration>,
    metrics_window: Duration,
    dedup_ttl: Duration,
    dedup_cleanup_interval: Duration,
    config: Arc<dyn ConfigProvider>,
    storage: Arc<dyn Storage>,
    monitoring: Arc<MonitoringEngine>,
    alerting: Arc<AlertingEngine>,
}

impl std::fmt::Debug for TickPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickPipeline")
            .field("options", &self.options)
            .field("candle_windows", &self.candle_windows)
            .field("metrics_window", &self.metrics_window)
            .field("alerting", &self.alerting)
            .finish_non_exhaustive()
    }
}

impl TickPipeline {
    /// Pipeline with default options, no alert rules & a private [`MonitoringEngine`].
    pub fn new(config: Arc<dyn ConfigProvider>, storage: Arc<dyn Storage>) -> Self {
        Self {
            options: PipelinePerformanceOptions::default(),
            candle_windows: DEFAULT_CANDLE_WINDOWS.to_vec(),
            metrics_window: DEFAULT_METRICS_WINDOW,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            dedup_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            alerting: Arc::new(AlertingEngine::new(
                Arc::clone(&config),
                NotifierRegistry::default(),
            )),
            config,
            storage,
            monitoring: Arc::new(MonitoringEngine::default()),
        }
    }

    /// Build a pipeline from validated startup configuration, constructing every configured
    /// alert rule. Unknown rules or unparseable rule parameters are fatal.
    pub fn from_config(
        config: &PipelineConfig,
        provider: Arc<dyn ConfigProvider>,
        storage: Arc<dyn Storage>,
        monitoring: Arc<MonitoringEngine>,
        notifiers: NotifierRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let alerting = AlertingEngine::from_config(Arc::clone(&provider), notifiers)?
            .with_storage(Arc::clone(&storage));

        Ok(Self::new(provider, storage)
            .with_options(config.performance.clone())
            .with_candle_windows(config.candle_windows())
            .with_metrics_window(config.metrics_window())
            .with_dedup_ttl(config.dedup_ttl(), config.dedup_cleanup_interval())
            .with_monitoring(monitoring)
            .with_alerting(Arc::new(alerting)))
    }

    pub fn with_options(mut self, options: PipelinePerformanceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_candle_windows(mut self, candle_windows: Vec<Duration>) -> Self {
        self.candle_windows = candle_windows;
        self
    }

    pub fn with_metrics_window(mut self, metrics_window: Duration) -> Self {
        self.metrics_window = metrics_window;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration, cleanup_interval: Duration) -> Self {
        self.dedup_ttl = ttl;
        self.dedup_cleanup_interval = cleanup_interval;
        self
    }

    pub fn with_monitoring(mut self, monitoring: Arc<MonitoringEngine>) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn with_alerting(mut self, alerting: Arc<AlertingEngine>) -> Self {
        self.alerting = alerting;
        self
    }

    pub fn options(&self) -> &PipelinePerformanceOptions {
        &self.options
    }

    pub fn monitoring(&self) -> &Arc<MonitoringEngine> {
        &self.monitoring
    }

    pub fn alerting(&self) -> &Arc<AlertingEngine> {
        &self.alerting
    }

    /// Spawn the writer, one task per partition lane and the dispatcher.
    ///
    /// Cancelling `cancellation` starts a graceful stop. Finish with
    /// [`PipelineHandle::shutdown`] to obtain the drain accounting.
    pub fn start(self, reader: TickReceiver, cancellation: CancellationToken) -> PipelineHandle {
        let Self {
            options,
            candle_windows,
            metrics_window,
            dedup_ttl,
            dedup_cleanup_interval,
            config,
            storage,
            monitoring,
            alerting,
        } = self;

        let partition_count = options.partition_count.max(1);
        let hard_stop = CancellationToken::new();
        let alert_permits = options
            .alerting_concurrency
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        let counters = Arc::new(PipelineCounters::default());

        let writer = BufferedStorageWriter::spawn(
            storage,
            options.writer_capacity,
            options.batch_size,
            options.flush_interval,
            hard_stop.clone(),
        );

        let (lane_txs, lanes): (Vec<_>, Vec<_>) = (0..partition_count)
            .map(|index| {
                let (tx, rx) = mpsc::channel(options.lane_capacity.max(1));
                let lane = Lane {
                    index,
                    rx,
                    conditioner: TickConditioner::with_ttl(
                        Arc::clone(&config),
                        dedup_ttl,
                        dedup_cleanup_interval,
                    ),
                    aggregation: AggregationEngine::new(candle_windows.clone(), metrics_window),
                    monitoring: Arc::clone(&monitoring),
                    alerting: Arc::clone(&alerting),
                    alert_permits: alert_permits.clone(),
                    writer: writer.handle(),
                    counters: Arc::clone(&counters),
                    persist_raw_ticks: options.persist_raw_ticks,
                    hard_stop: hard_stop.clone(),
                };
                (tx, tokio::spawn(lane.run()))
            })
            .unzip();

        let accepted = Arc::clone(&reader.state);
        let dispatcher = tokio::spawn(dispatch(
            reader,
            lane_txs,
            Arc::clone(&counters),
            cancellation.clone(),
            hard_stop.clone(),
        ));

        info!(
            partition_count,
            lane_capacity = options.lane_capacity,
            batch_size = options.batch_size,
            flush_interval_ms = options.flush_interval.as_millis() as u64,
            persist_raw_ticks = options.persist_raw_ticks,
            "tick pipeline started"
        );

        PipelineHandle {
            cancellation,
            hard_stop,
            drain_timeout: options.drain_timeout,
            accepted,
            counters,
            dispatcher,
            lanes,
            writer,
        }
    }
}

/// Running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    cancellation: CancellationToken,
    hard_stop: CancellationToken,
    drain_timeout: Duration,
    accepted: Arc<ChannelState>,
    counters: Arc<PipelineCounters>,
    dispatcher: JoinHandle<()>,
    lanes: Vec<JoinHandle<LaneSummary>>,
    writer: BufferedStorageWriter,
}

impl PipelineHandle {
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    pub fn consumed_tick_count(&self) -> u64 {
        self.counters.consumed_tick_count()
    }

    pub fn accepted_tick_count(&self) -> u64 {
        self.accepted.accepted.load(Ordering::SeqCst)
    }

    pub fn writer_stats(&self) -> StorageWriterStats {
        self.writer.stats()
    }

    /// Stop intake and drain, bounded by `drain_timeout`.
    ///
    /// On timeout the hard stop fires and `dropped = accepted - consumed` is reported instead
    /// of waiting for the backlog.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            cancellation,
            hard_stop,
            drain_timeout,
            accepted,
            counters,
            dispatcher,
            lanes,
            writer,
        } = self;

        cancellation.cancel();
        info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "tick pipeline draining");

        let mut drain = Box::pin(async move {
            if let Err(error) = dispatcher.await {
                error!(?error, "pipeline dispatcher failed");
            }

            let summaries = join_all(lanes)
                .await
                .into_iter()
                .filter_map(|summary| match summary {
                    Ok(summary) => Some(summary),
                    Err(error) => {
                        error!(?error, "pipeline lane failed");
                        None
                    }
                })
                .collect::<Vec<_>>();

            (summaries, writer.close().await)
        });

        let (timed_out, (summaries, writer)) = tokio::select! {
            drained = &mut drain => (false, drained),
            _ = tokio::time::sleep(drain_timeout) => {
                warn!("drain timeout elapsed, hard stopping pipeline");
                hard_stop.cancel();
                (true, drain.await)
            }
        };

        let accepted = accepted.accepted.load(Ordering::SeqCst);
        let consumed = counters.consumed_tick_count();
        let processed = counters.processed_tick_count();
        let dropped = accepted.saturating_sub(consumed);
        counters.dropped.store(dropped, Ordering::SeqCst);

        let (conditioner, flushed_open_candles) = summaries.iter().fold(
            (ConditionerStats::default(), 0u64),
            |(mut conditioner, flushed), summary| {
                conditioner.merge(&summary.conditioner);
                (conditioner, flushed + summary.flushed_open_candles as u64)
            },
        );

        let report = ShutdownReport {
            accepted,
            consumed,
            processed,
            dropped,
            abandoned_in_lanes: consumed.saturating_sub(processed),
            timed_out,
            flushed_open_candles,
            conditioner,
            writer,
        };

        if report.dropped > 0 || report.abandoned_in_lanes > 0 {
            warn!(?report, "tick pipeline stopped with unprocessed ticks");
        } else {
            info!(?report, "tick pipeline stopped");
        }

        report
    }
}

async fn dispatch(
    mut reader: TickReceiver,
    lanes: Vec<mpsc::Sender<Tick>>,
    counters: Arc<PipelineCounters>,
    cancellation: CancellationToken,
    hard_stop: CancellationToken,
) {
    loop {
        let tick = tokio::select! {
            biased;
            _ = hard_stop.cancelled() => break,
            _ = cancellation.cancelled() => {
                drain(&mut reader, &lanes, &counters, &hard_stop).await;
                break;
            }
            tick = reader.rx.recv() => tick,
        };

        let Some(tick) = tick else {
            debug!("every tick sender dropped, dispatcher stopping");
            break;
        };

        if !route(tick, &lanes, &counters, &hard_stop).await {
            break;
        }
    }

    // Dropping the lane senders lets each lane finish its queue and exit
    drop(lanes);
}

/// Close intake and route whatever is still buffered in the source channel.
async fn drain(
    reader: &mut TickReceiver,
    lanes: &[mpsc::Sender<Tick>],
    counters: &PipelineCounters,
    hard_stop: &CancellationToken,
) {
    reader.rx.close();

    loop {
        let tick = tokio::select! {
            biased;
            _ = hard_stop.cancelled() => return,
            tick = reader.rx.recv() => tick,
        };

        let Some(tick) = tick else {
            return;
        };

        if !route(tick, lanes, counters, hard_stop).await {
            return;
        }
    }
}

/// Count the tick as consumed and forward it to its partition lane. Returns `false` if the
/// hard stop interrupted a blocked send.
async fn route(
    tick: Tick,
    lanes: &[mpsc::Sender<Tick>],
    counters: &PipelineCounters,
    hard_stop: &CancellationToken,
) -> bool {
    counters.record_consumed();
    let partition = partition_for(&tick.symbol, lanes.len());

    tokio::select! {
        biased;
        _ = hard_stop.cancelled() => false,
        sent = lanes[partition].send(tick) => {
            if sent.is_err() {
                warn!(partition, "pipeline lane stopped, tick discarded");
            }
            true
        }
    }
}
