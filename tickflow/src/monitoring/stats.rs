use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Derived health of a source or exchange. Ordered by severity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Display,
    Deserialize,
    Serialize,
)]
pub enum Status {
    #[default]
    #[display("OK")]
    Ok,
    #[display("WARN")]
    Warn,
    #[display("CRITICAL")]
    Critical,
}

impl Status {
    /// Classify ages/delays against the warn & critical thresholds.
    pub fn classify<I>(measurements_ms: I, warn_delay_ms: u64, critical_delay_ms: u64) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        measurements_ms
            .into_iter()
            .map(|value| {
                if value > critical_delay_ms as f64 {
                    Status::Critical
                } else if value > warn_delay_ms as f64 {
                    Status::Warn
                } else {
                    Status::Ok
                }
            })
            .max()
            .unwrap_or_default()
    }
}

/// Lifetime plus windowed counters shared by source & exchange snapshots.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthStats {
    pub total_ticks: u64,
    pub total_aggregates: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub windowed_ticks: u64,
    pub windowed_aggregates: u64,
    pub ticks_per_second: f64,
    pub avg_delay_ms: f64,
    pub max_delay_ms: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_age_ms: Option<u64>,
    pub status: Status,
}

/// Health of one ingestion feed (eg/ `binance-ws`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceStats {
    pub name: SmolStr,
    pub exchange: SmolStr,
    pub online: bool,
    #[serde(flatten)]
    pub stats: HealthStats,
}

/// Health of one exchange, across every feed delivering its ticks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExchangeStats {
    pub name: SmolStr,
    pub feeds: Vec<SmolStr>,
    #[serde(flatten)]
    pub stats: HealthStats,
}

/// Point in time health report, serialisable for JSON export.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MonitoringReport {
    pub generated_at: DateTime<Utc>,
    pub overall: Status,
    pub sources: Vec<SourceStats>,
    pub exchanges: Vec<ExchangeStats>,
    pub warnings: Vec<String>,
}

impl SourceStats {
    /// Fixed-format warning line for a non-Ok source.
    pub fn warning(&self) -> String {
        if !self.online {
            return format!("{} {} ({}): offline", self.stats.status, self.name, self.exchange);
        }

        let last_tick = self
            .stats
            .last_tick_age_ms
            .map_or_else(|| "never".to_string(), |age| format!("{age}ms ago"));

        format!(
            "{} {} ({}): last tick {}, avg delay {:.0}ms, max delay {}ms",
            self.stats.status,
            self.name,
            self.exchange,
            last_tick,
            self.stats.avg_delay_ms,
            self.stats.max_delay_ms,
        )
    }
}
