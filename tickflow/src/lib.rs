#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Tickflow
//! Multi-exchange market data tick pipeline.
//!
//! Sources (WebSocket streams, REST pollers) of one or more exchanges write raw trade [`Tick`]s
//! into a bounded channel. The [`TickPipeline`] partitions ticks by symbol across lanes; each
//! lane conditions, deduplicates and fingerprints ticks, builds OHLCV candles and rolling
//! metrics, evaluates alert rules, feeds health monitoring and hands records to a batching
//! storage writer.
//!
//! A shared [`CursorStore`] keeps the transports of one exchange from delivering the same trade
//! twice, and [`PipelineHandle::shutdown`] reports exactly how many accepted ticks never made
//! it through.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use tickflow::{
//!     config::{RuntimeConfig, SharedConfig},
//!     pipeline::{TickPipeline, tick_channel},
//!     storage::InMemoryStorage,
//!     tick::Tick,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() {
//! let config = Arc::new(SharedConfig::new(RuntimeConfig::new(["BTCUSDT"], Vec::new())));
//! let (tx, rx) = tick_channel(1024);
//!
//! let pipeline = TickPipeline::new(config, Arc::new(InMemoryStorage::default()))
//!     .start(rx, CancellationToken::new());
//!
//! let tick = Tick::new("binance", "BTCUSDT", 100.into(), 1.into(), chrono::Utc::now());
//! tx.send(tick).await.unwrap();
//!
//! let report = pipeline.shutdown().await;
//! assert_eq!(report.dropped, 0);
//! # }
//! ```

/// OHLCV candle & rolling metrics aggregation per symbol.
pub mod aggregation;

/// Alert rules, notifier channels & the [`AlertingEngine`](alerting::AlertingEngine).
pub mod alerting;

/// Validation, normalisation & TTL deduplication of raw ticks.
pub mod conditioner;

/// File & environment configuration, plus the hot-reloadable runtime allow-list & alert rules.
pub mod config;

/// Cross-transport emission cursor.
pub mod cursor;

/// All [`Error`](std::error::Error)s generated in Tickflow.
pub mod error;

/// Deterministic tick fingerprints.
pub mod fingerprint;

/// Rolling per-feed & per-exchange health monitoring.
pub mod monitoring;

/// Partitioned orchestration & shutdown accounting.
pub mod pipeline;

/// Ingestion source trait, registry & supervision.
pub mod source;

/// Storage trait, in-memory backend & batching writer.
pub mod storage;

/// Raw & normalised tick types.
pub mod tick;

pub use cursor::CursorStore;
pub use error::PipelineError;
pub use pipeline::{PipelineHandle, ShutdownReport, TickPipeline, tick_channel};
pub use tick::{NormalizedTick, Tick};
