use super::PipelineCounters;
use crate::{
    aggregation::AggregationEngine,
    alerting::AlertingEngine,
    conditioner::{ConditionerStats, TickConditioner},
    error::StorageError,
    monitoring::MonitoringEngine,
    storage::{StorageRecord, StorageWriterHandle},
    tick::Tick,
};
use chrono::Utc;
use std::{future::Future, sync::Arc};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a lane reports once its task ends.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LaneSummary {
    pub conditioner: ConditionerStats,
    pub flushed_open_candles: usize,
}

/// One partition of the pipeline: owns a conditioner & aggregation engine and processes its
/// ticks strictly in arrival order.
pub(crate) struct Lane {
    pub index: usize,
    pub rx: mpsc::Receiver<Tick>,
    pub conditioner: TickConditioner,
    pub aggregation: AggregationEngine,
    pub monitoring: Arc<MonitoringEngine>,
    pub alerting: Arc<AlertingEngine>,
    /// Delivery cap shared by every lane, `None` when uncapped.
    pub alert_permits: Option<Arc<Semaphore>>,
    pub writer: StorageWriterHandle,
    pub counters: Arc<PipelineCounters>,
    pub persist_raw_ticks: bool,
    pub hard_stop: CancellationToken,
}

impl Lane {
    pub async fn run(mut self) -> LaneSummary {
        debug!(lane = self.index, "lane started");

        loop {
            let tick = tokio::select! {
                biased;
                _ = self.hard_stop.cancelled() => {
                    return self.summary(0);
                }
                tick = self.rx.recv() => tick,
            };

            let Some(tick) = tick else {
                break;
            };

            if self.process(tick).await.is_err() {
                return self.summary(0);
            }
            self.counters.record_processed();
        }

        // Graceful drain completed: persist candles still in flight
        let open = self.aggregation.flush_open_candles();
        let flushed = open.len();
        for candle in open {
            if self.enqueue(candle).await.is_err() {
                return self.summary(0);
            }
        }

        debug!(lane = self.index, flushed, "lane drained");
        self.summary(flushed)
    }

    /// Conditioner → aggregation → monitoring → alerting → buffered writer.
    async fn process(&mut self, tick: Tick) -> Result<(), Stopped> {
        let now = Utc::now();

        if self.persist_raw_ticks {
            self.enqueue(tick.clone()).await?;
        }

        let (feed, exchange) = (tick.feed.clone(), tick.source.clone());
        let tick = match self.conditioner.condition(tick) {
            Ok(tick) => tick,
            Err(rejection) => {
                self.monitoring
                    .record_rejection(&feed, &exchange, rejection, now);
                return Ok(());
            }
        };

        let output = self.aggregation.apply(&tick);

        self.monitoring.record_tick(&feed, &exchange, now);
        self.monitoring
            .record_delay(&feed, &exchange, tick.delay_ms(), now);
        for _ in &output.closed_candles {
            self.monitoring.record_aggregate(&feed, &exchange, now);
        }

        self.guard(self.alerting.evaluate_with_permits(
            &tick,
            &output.metrics,
            self.alert_permits.as_deref(),
        ))
        .await?;

        self.enqueue(tick).await?;
        for candle in output.closed_candles {
            self.enqueue(candle).await?;
        }
        self.enqueue(output.metrics).await?;

        Ok(())
    }

    async fn enqueue(&self, record: impl Into<StorageRecord>) -> Result<(), Stopped> {
        match self.guard(self.writer.enqueue(record)).await? {
            Ok(()) => Ok(()),
            Err(StorageError::WriterClosed) => {
                warn!(lane = self.index, "storage writer closed, lane stopping");
                Err(Stopped)
            }
            Err(error) => {
                warn!(lane = self.index, ?error, "failed to enqueue storage record");
                Ok(())
            }
        }
    }

    async fn guard<F>(&self, future: F) -> Result<F::Output, Stopped>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.hard_stop.cancelled() => Err(Stopped),
            output = future => Ok(output),
        }
    }

    fn summary(&self, flushed_open_candles: usize) -> LaneSummary {
        LaneSummary {
            conditioner: self.conditioner.stats(),
            flushed_open_candles,
        }
    }
}

/// The hard stop fired while the lane was blocked.
#[derive(Debug)]
pub(crate) struct Stopped;
