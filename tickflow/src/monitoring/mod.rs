//! Feed health monitoring.
//!
//! The [`MonitoringEngine`] is an explicitly owned object, shared by `Arc` between the lanes,
//! the source supervisor and whatever reports on it. Each feed and each exchange owns a
//! [`RollingWindow`] of per-second buckets plus lifetime atomics, so recording never takes a
//! lock wider than one bucket and a snapshot never blocks the recording path.

use crate::{conditioner::Rejection, config::MonitoringConfig};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};
use tracing::{info, warn};

pub use ring::{BucketTotals, RollingWindow};
pub use stats::{ExchangeStats, HealthStats, MonitoringReport, SourceStats, Status};

/// Per-second bucket ring.
pub mod ring;

/// Health snapshot & report types.
pub mod stats;

const NO_TICK: i64 = i64::MIN;

#[derive(Debug)]
struct Counters {
    window: RollingWindow,
    total_ticks: AtomicU64,
    total_aggregates: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    last_tick_ms: AtomicI64,
    registered_ms: i64,
}

impl Counters {
    fn new(window_seconds: usize, registered_at: DateTime<Utc>) -> Self {
        Self {
            window: RollingWindow::new(window_seconds),
            total_ticks: AtomicU64::new(0),
            total_aggregates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            last_tick_ms: AtomicI64::new(NO_TICK),
            registered_ms: registered_at.timestamp_millis(),
        }
    }

    fn record_tick(&self, now: DateTime<Utc>) {
        self.window.record_tick(now.timestamp());
        self.total_ticks.fetch_add(1, Ordering::Relaxed);
        self.last_tick_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn record_aggregate(&self, now: DateTime<Utc>) {
        self.window.record_aggregate(now.timestamp());
        self.total_aggregates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delay(&self, delay_ms: u64, now: DateTime<Utc>) {
        self.window.record_delay(now.timestamp(), delay_ms);
    }

    fn record_rejection(&self, rejection: Rejection) {
        match rejection {
            Rejection::Duplicate => self.duplicates.fetch_add(1, Ordering::Relaxed),
            _ => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn last_tick_ms(&self) -> Option<i64> {
        match self.last_tick_ms.load(Ordering::Relaxed) {
            NO_TICK => None,
            millis => Some(millis),
        }
    }

    fn health(&self, now: DateTime<Utc>, config: &MonitoringConfig) -> HealthStats {
        let totals = self.window.totals(now.timestamp());
        let now_ms = now.timestamp_millis();
        let last_tick_ms = self.last_tick_ms();
        let last_tick_age_ms = last_tick_ms.map(|last| now_ms.saturating_sub(last).max(0) as u64);

        // A feed that never ticked ages from its registration
        let silence_ms = now_ms
            .saturating_sub(last_tick_ms.unwrap_or(self.registered_ms))
            .max(0);

        let status = Status::classify(
            [
                silence_ms as f64,
                totals.avg_delay_ms(),
                totals.max_delay_ms as f64,
            ],
            config.warn_delay_ms,
            config.critical_delay_ms,
        );

        HealthStats {
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            total_aggregates: self.total_aggregates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            windowed_ticks: totals.ticks,
            windowed_aggregates: totals.aggregates,
            ticks_per_second: totals.ticks as f64 / self.window.len() as f64,
            avg_delay_ms: totals.avg_delay_ms(),
            max_delay_ms: totals.max_delay_ms,
            last_tick_at: last_tick_ms.and_then(DateTime::from_timestamp_millis),
            last_tick_age_ms,
            status,
        }
    }
}

#[derive(Debug)]
struct FeedMonitor {
    exchange: SmolStr,
    online: AtomicBool,
    counters: Counters,
}

type Registry<T> = RwLock<FnvHashMap<SmolStr, Arc<T>>>;

/// Rolling health counters per feed and per exchange.
#[derive(Debug)]
pub struct MonitoringEngine {
    config: MonitoringConfig,
    feeds: Registry<FeedMonitor>,
    exchanges: Registry<Counters>,
}

impl Default for MonitoringEngine {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}

impl MonitoringEngine {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            feeds: RwLock::default(),
            exchanges: RwLock::default(),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Register a feed ahead of its first tick so a silent feed is reported.
    pub fn register_source(&self, feed: &str, exchange: &str, now: DateTime<Utc>) {
        self.feed(feed, exchange, now);
        self.exchange(exchange, now);
    }

    pub fn set_online(&self, feed: &str, online: bool) {
        let Some(monitor) = self.feeds.read().get(feed).cloned() else {
            warn!(%feed, online, "status change for unregistered feed ignored");
            return;
        };

        if monitor.online.swap(online, Ordering::Relaxed) != online {
            info!(%feed, exchange = %monitor.exchange, online, "feed status changed");
        }
    }

    pub fn record_tick(&self, feed: &str, exchange: &str, now: DateTime<Utc>) {
        self.feed(feed, exchange, now).counters.record_tick(now);
        self.exchange(exchange, now).record_tick(now);
    }

    pub fn record_aggregate(&self, feed: &str, exchange: &str, now: DateTime<Utc>) {
        self.feed(feed, exchange, now).counters.record_aggregate(now);
        self.exchange(exchange, now).record_aggregate(now);
    }

    pub fn record_delay(&self, feed: &str, exchange: &str, delay_ms: u64, now: DateTime<Utc>) {
        self.feed(feed, exchange, now).counters.record_delay(delay_ms, now);
        self.exchange(exchange, now).record_delay(delay_ms, now);
    }

    pub fn record_rejection(
        &self,
        feed: &str,
        exchange: &str,
        rejection: Rejection,
        now: DateTime<Utc>,
    ) {
        self.feed(feed, exchange, now).counters.record_rejection(rejection);
        self.exchange(exchange, now).record_rejection(rejection);
    }

    /// Health of one feed. An offline feed is always [`Status::Critical`].
    pub fn snapshot(&self, feed: &str, now: DateTime<Utc>) -> Option<SourceStats> {
        let monitor = self.feeds.read().get(feed).cloned()?;
        Some(self.source_stats(feed, &monitor, now))
    }

    pub fn exchange_snapshot(&self, exchange: &str, now: DateTime<Utc>) -> Option<ExchangeStats> {
        let counters = self.exchanges.read().get(exchange).cloned()?;
        let feeds = self.feeds_of(exchange);
        Some(self.exchange_stats(exchange, &counters, feeds, now))
    }

    /// Non-Ok feeds, most severe first then by name.
    pub fn warnings(&self, now: DateTime<Utc>) -> Vec<String> {
        Self::warnings_from(&self.sources(now))
    }

    pub fn report(&self, now: DateTime<Utc>) -> MonitoringReport {
        let sources = self.sources(now);

        let exchanges = self
            .exchanges
            .read()
            .iter()
            .map(|(name, counters)| (name.clone(), Arc::clone(counters)))
            .collect::<Vec<_>>()
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(name, counters)| {
                let feeds = self.feeds_of(&name);
                self.exchange_stats(&name, &counters, feeds, now)
            })
            .collect::<Vec<_>>();

        let overall = sources
            .iter()
            .map(|source| source.stats.status)
            .chain(exchanges.iter().map(|exchange| exchange.stats.status))
            .max()
            .unwrap_or_default();

        MonitoringReport {
            generated_at: now,
            overall,
            warnings: Self::warnings_from(&sources),
            sources,
            exchanges,
        }
    }

    fn sources(&self, now: DateTime<Utc>) -> Vec<SourceStats> {
        self.feeds
            .read()
            .iter()
            .map(|(name, monitor)| (name.clone(), Arc::clone(monitor)))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(name, monitor)| self.source_stats(&name, &monitor, now))
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect()
    }

    fn warnings_from(sources: &[SourceStats]) -> Vec<String> {
        sources
            .iter()
            .filter(|source| source.stats.status != Status::Ok)
            .sorted_by(|a, b| {
                b.stats
                    .status
                    .cmp(&a.stats.status)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(SourceStats::warning)
            .collect()
    }

    fn source_stats(&self, name: &str, monitor: &FeedMonitor, now: DateTime<Utc>) -> SourceStats {
        let online = monitor.online.load(Ordering::Relaxed);
        let mut stats = monitor.counters.health(now, &self.config);
        if !online {
            stats.status = Status::Critical;
        }

        SourceStats {
            name: SmolStr::new(name),
            exchange: monitor.exchange.clone(),
            online,
            stats,
        }
    }

    fn exchange_stats(
        &self,
        name: &str,
        counters: &Counters,
        feeds: Vec<(SmolStr, bool)>,
        now: DateTime<Utc>,
    ) -> ExchangeStats {
        let mut stats = counters.health(now, &self.config);
        if !feeds.is_empty() && feeds.iter().all(|(_, online)| !online) {
            stats.status = Status::Critical;
        }

        ExchangeStats {
            name: SmolStr::new(name),
            feeds: feeds.into_iter().map(|(feed, _)| feed).collect(),
            stats,
        }
    }

    fn feeds_of(&self, exchange: &str) -> Vec<(SmolStr, bool)> {
        self.feeds
            .read()
            .iter()
            .filter(|(_, monitor)| monitor.exchange == exchange)
            .map(|(name, monitor)| (name.clone(), monitor.online.load(Ordering::Relaxed)))
            .sorted()
            .collect()
    }

    fn feed(&self, feed: &str, exchange: &str, now: DateTime<Utc>) -> Arc<FeedMonitor> {
        if let Some(monitor) = self.feeds.read().get(feed) {
            return Arc::clone(monitor);
        }

        let window_seconds = self.config.rolling_window_seconds;
        Arc::clone(
            self.feeds
                .write()
                .entry(SmolStr::new(feed))
                .or_insert_with(|| {
                    Arc::new(FeedMonitor {
                        exchange: SmolStr::new(exchange),
                        online: AtomicBool::new(true),
                        counters: Counters::new(window_seconds, now),
                    })
                }),
        )
    }

    fn exchange(&self, exchange: &str, now: DateTime<Utc>) -> Arc<Counters> {
        if let Some(counters) = self.exchanges.read().get(exchange) {
            return Arc::clone(counters);
        }

        let window_seconds = self.config.rolling_window_seconds;
        Arc::clone(
            self.exchanges
                .write()
                .entry(SmolStr::new(exchange))
                .or_insert_with(|| Arc::new(Counters::new(window_seconds, now))),
        )
    }
}
