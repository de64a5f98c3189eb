use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tickflow::{
    CursorStore,
    alerting::{LogNotifier, NotifierRegistry},
    config::{PipelineConfig, SharedConfig},
    monitoring::MonitoringEngine,
    pipeline::{PipelinePerformanceOptions, TickPipeline, run_synthetic_load, tick_channel},
    source::{SourceDeps, SourceRegistry, SourceSupervisor},
    storage::{InMemoryStorage, Storage},
};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use synthetic::{SyntheticPoller, SyntheticStream, SyntheticTape};

mod synthetic;

/// Spacing between trades on each synthetic tape.
const TAPE_SPACING: Duration = Duration::from_millis(25);

#[tokio::main]
async fn main() {
    init_logging();

    let config = match PipelineConfig::load() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            std::process::exit(1);
        }
    };

    // Benchmark mode via TICKFLOW_BENCH env var (any value but 0/false)
    let bench = std::env::var("TICKFLOW_BENCH")
        .map(|value| !matches!(value.trim(), "" | "0" | "false"))
        .unwrap_or(false);

    if bench {
        run_benchmark().await;
    } else {
        run(config).await;
    }
}

async fn run(config: PipelineConfig) {
    info!(symbols = ?config.symbols, "starting tickflow");

    let provider = Arc::new(SharedConfig::new(config.runtime()));
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let monitoring = Arc::new(MonitoringEngine::new(config.monitoring.clone()));
    let notifiers = NotifierRegistry::new().with_notifier(LogNotifier);

    let pipeline = match TickPipeline::from_config(
        &config,
        provider,
        storage,
        Arc::clone(&monitoring),
        notifiers,
    ) {
        Ok(pipeline) => pipeline,
        Err(error) => {
            error!(%error, "failed to build pipeline");
            std::process::exit(1);
        }
    };

    let performance = &config.performance;
    let (tx, rx) = tick_channel(performance.lane_capacity * performance.partition_count);
    let pipeline = pipeline.start(rx, CancellationToken::new());

    // Two transports of one exchange share a tape, a second exchange streams only
    let binance = Arc::new(SyntheticTape::new("binance", &config.symbols, TAPE_SPACING));
    let okx = Arc::new(SyntheticTape::new("okx", &config.symbols, TAPE_SPACING * 2));

    let registry = SourceRegistry::new()
        .with_source(SyntheticStream::new("binance-ws", Arc::clone(&binance)))
        .with_source(SyntheticPoller::new(
            "binance-rest",
            binance,
            Duration::from_secs(1),
            80,
        ))
        .with_source(SyntheticStream::new("okx-ws", okx));

    let sources_cancel = CancellationToken::new();
    let supervisor = SourceSupervisor::spawn(
        registry,
        SourceDeps {
            sender: tx,
            cursor: Arc::new(CursorStore::new(config.cursor_ttl())),
            monitoring: Arc::clone(&monitoring),
            cancel: sources_cancel.clone(),
        },
    );

    let mut report_interval = interval(Duration::from_secs(config.report_interval_secs));
    report_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    error!(%error, "failed to listen for ctrl-c");
                }
                info!("shutdown requested");
                break;
            }
            _ = report_interval.tick() => {
                log_report(&monitoring);
            }
        }
    }

    supervisor.shutdown().await;

    let shutdown = pipeline.shutdown().await;
    match serde_json::to_string(&shutdown) {
        Ok(json) => info!(report = %json, "tickflow stopped"),
        Err(error) => warn!(%error, ?shutdown, "failed to serialise shutdown report"),
    }
    log_report(&monitoring);
}

fn log_report(monitoring: &MonitoringEngine) {
    let report = monitoring.report(Utc::now());

    for warning in &report.warnings {
        warn!("{warning}");
    }

    match serde_json::to_string(&report) {
        Ok(json) => info!(overall = %report.overall, report = %json, "monitoring report"),
        Err(error) => warn!(%error, "failed to serialise monitoring report"),
    }
}

/// Run the synthetic load harness with baseline then tuned options against a storage backend
/// with remote-like write latency.
async fn run_benchmark() {
    const SOURCES: usize = 3;
    const TICKS_PER_SOURCE: usize = 2_000;
    const WRITE_LATENCY: Duration = Duration::from_millis(1);

    let drain_timeout = Duration::from_secs(120);
    let runs = [
        ("baseline", PipelinePerformanceOptions::baseline()),
        ("tuned", PipelinePerformanceOptions::tuned()),
    ];

    let mut results = Vec::with_capacity(runs.len());
    for (run, options) in runs {
        info!(run, ?options, "benchmark run starting");
        let storage = Arc::new(InMemoryStorage::new().with_write_latency(WRITE_LATENCY));
        let report = run_synthetic_load(
            options.with_drain_timeout(drain_timeout),
            storage,
            SOURCES,
            TICKS_PER_SOURCE,
        )
        .await;

        match serde_json::to_string(&report) {
            Ok(json) => info!(run, report = %json, "benchmark run finished"),
            Err(error) => warn!(run, %error, "failed to serialise benchmark report"),
        }
        results.push(report.ticks_per_second);
    }

    if let [baseline, tuned] = results[..] {
        info!(
            baseline_ticks_per_second = baseline,
            tuned_ticks_per_second = tuned,
            speedup = tuned / baseline.max(f64::EPSILON),
            "benchmark complete"
        );
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
