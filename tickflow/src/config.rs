//! Pipeline configuration.
//!
//! [`PipelineConfig`] is loaded once at startup (defaults, optional JSON file, then `TICKFLOW_*`
//! environment overrides). Any unparseable value is a fatal [`ConfigError`].
//!
//! The parts that may change while the pipeline runs (symbol allow-list, alert rule configs)
//! are published through a [`ConfigProvider`] as an immutable [`RuntimeConfig`] snapshot, which
//! lanes re-read per tick rather than caching across a reconfiguration. Candle and metrics
//! window sizes are startup-only: each lane builds its aggregation state from them once.

use crate::{
    alerting::{AlertRuleConfig, AlertRuleSet},
    error::ConfigError,
    pipeline::PipelinePerformanceOptions,
};
use fnv::FnvHashSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{path::Path, str::FromStr, sync::Arc, time::Duration};
use tracing::info;

/// Environment variable holding an optional JSON config file path.
pub const ENV_CONFIG_PATH: &str = "TICKFLOW_CONFIG";

/// Health thresholds used by the [`MonitoringEngine`](crate::monitoring::MonitoringEngine).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub rolling_window_seconds: usize,
    pub warn_delay_ms: u64,
    pub critical_delay_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            rolling_window_seconds: 60,
            warn_delay_ms: 2_000,
            critical_delay_ms: 10_000,
        }
    }
}

/// Complete startup configuration of a tickflow deployment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Symbol allow-list, matched case-insensitively.
    pub symbols: Vec<String>,
    /// Candle window sizes in seconds. Startup-only.
    pub candle_windows_secs: Vec<u64>,
    /// Rolling metrics window in seconds. Startup-only.
    pub metrics_window_secs: u64,
    /// Conditioner fingerprint TTL in seconds.
    pub dedup_ttl_secs: u64,
    /// Minimum seconds between conditioner dedup cleanups.
    pub dedup_cleanup_interval_secs: u64,
    /// Cursor store recent-fingerprint TTL in seconds.
    pub cursor_ttl_secs: u64,
    /// Seconds between monitoring reports logged by the server.
    pub report_interval_secs: u64,
    pub monitoring: MonitoringConfig,
    pub performance: PipelinePerformanceOptions,
    pub alert_rules: Vec<AlertRuleConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"]
                .into_iter()
                .map(String::from)
                .collect(),
            candle_windows_secs: vec![60, 300, 3_600],
            metrics_window_secs: 60,
            dedup_ttl_secs: 300,
            dedup_cleanup_interval_secs: 5,
            cursor_ttl_secs: 120,
            report_interval_secs: 10,
            monitoring: MonitoringConfig::default(),
            performance: PipelinePerformanceOptions::default(),
            alert_rules: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load defaults, overlay the JSON file named by `TICKFLOW_CONFIG` (if set), then apply
    /// `TICKFLOW_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => {
                info!(%path, "loading pipeline config file");
                Self::from_json_file(path)?
            }
            Err(_) => Self::default(),
        };

        let config = config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `TICKFLOW_*` environment overrides, ignoring any config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))
    }

    /// Apply `TICKFLOW_*` overrides using the provided variable lookup.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbols) = lookup("TICKFLOW_SYMBOLS") {
            self.symbols = symbols
                .split(',')
                .map(|symbol| symbol.trim().to_uppercase())
                .filter(|symbol| !symbol.is_empty())
                .collect();
        }

        let performance = &mut self.performance;
        override_with(&lookup, "TICKFLOW_PARTITIONS", &mut performance.partition_count)?;
        override_with(&lookup, "TICKFLOW_BATCH_SIZE", &mut performance.batch_size)?;
        override_with(&lookup, "TICKFLOW_LANE_CAPACITY", &mut performance.lane_capacity)?;
        override_with(&lookup, "TICKFLOW_WRITER_CAPACITY", &mut performance.writer_capacity)?;
        override_with(&lookup, "TICKFLOW_PERSIST_RAW", &mut performance.persist_raw_ticks)?;

        let mut flush_ms = performance.flush_interval.as_millis() as u64;
        override_with(&lookup, "TICKFLOW_FLUSH_INTERVAL_MS", &mut flush_ms)?;
        performance.flush_interval = Duration::from_millis(flush_ms);

        let mut drain_ms = performance.drain_timeout.as_millis() as u64;
        override_with(&lookup, "TICKFLOW_DRAIN_TIMEOUT_MS", &mut drain_ms)?;
        performance.drain_timeout = Duration::from_millis(drain_ms);

        // 0 disables the cap
        let concurrency = parse_env::<usize, _>(&lookup, "TICKFLOW_ALERTING_CONCURRENCY")?;
        if let Some(concurrency) = concurrency {
            performance.alerting_concurrency = (concurrency > 0).then_some(concurrency);
        }

        let monitoring = &mut self.monitoring;
        override_with(&lookup, "TICKFLOW_WARN_DELAY_MS", &mut monitoring.warn_delay_ms)?;
        override_with(&lookup, "TICKFLOW_CRITICAL_DELAY_MS", &mut monitoring.critical_delay_ms)?;
        override_with(
            &lookup,
            "TICKFLOW_ROLLING_WINDOW_SECS",
            &mut monitoring.rolling_window_seconds,
        )?;

        override_with(&lookup, "TICKFLOW_REPORT_INTERVAL_SECS", &mut self.report_interval_secs)?;

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.performance.validate()?;

        let zero_checks = [
            ("metrics_window_secs", self.metrics_window_secs),
            ("dedup_ttl_secs", self.dedup_ttl_secs),
            ("cursor_ttl_secs", self.cursor_ttl_secs),
            ("report_interval_secs", self.report_interval_secs),
            (
                "monitoring.rolling_window_seconds",
                self.monitoring.rolling_window_seconds as u64,
            ),
        ];
        if let Some((key, value)) = zero_checks.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(key, value));
        }

        if let Some(window) = self.candle_windows_secs.iter().find(|window| **window == 0) {
            return Err(invalid("candle_windows_secs", window));
        }

        if self.monitoring.warn_delay_ms > self.monitoring.critical_delay_ms {
            return Err(invalid(
                "monitoring.warn_delay_ms",
                self.monitoring.warn_delay_ms,
            ));
        }

        Ok(())
    }

    pub fn candle_windows(&self) -> Vec<Duration> {
        self.candle_windows_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn dedup_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_cleanup_interval_secs)
    }

    pub fn cursor_ttl(&self) -> Duration {
        Duration::from_secs(self.cursor_ttl_secs)
    }

    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig::new(self.symbols.iter(), self.alert_rules.iter().cloned())
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_alert_rules(mut self, alert_rules: Vec<AlertRuleConfig>) -> Self {
        self.alert_rules = alert_rules;
        self
    }

    pub fn with_performance(mut self, performance: PipelinePerformanceOptions) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, raw)),
        None => Ok(None),
    }
}

fn override_with<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_env(lookup, key)? {
        *target = value;
    }
    Ok(())
}

/// Runtime-updatable configuration snapshot consulted by the lanes on every tick.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    allowed_symbols: FnvHashSet<SmolStr>,
    alert_rules: AlertRuleSet,
}

impl RuntimeConfig {
    pub fn new<Symbols, S, Rules>(symbols: Symbols, alert_rules: Rules) -> Self
    where
        Symbols: IntoIterator<Item = S>,
        S: AsRef<str>,
        Rules: IntoIterator<Item = AlertRuleConfig>,
    {
        Self {
            allowed_symbols: symbols
                .into_iter()
                .map(|symbol| SmolStr::new(symbol.as_ref().trim().to_uppercase()))
                .collect(),
            alert_rules: AlertRuleSet::new(alert_rules),
        }
    }

    /// Case-insensitive allow-list lookup.
    pub fn is_symbol_allowed(&self, symbol: &str) -> bool {
        self.allowed_symbols
            .contains(symbol.trim().to_uppercase().as_str())
    }

    pub fn allowed_symbols(&self) -> impl Iterator<Item = &SmolStr> {
        self.allowed_symbols.iter()
    }

    pub fn alert_rules(&self) -> &AlertRuleSet {
        &self.alert_rules
    }

    pub fn with_alert_rules<I>(mut self, alert_rules: I) -> Self
    where
        I: IntoIterator<Item = AlertRuleConfig>,
    {
        self.alert_rules = AlertRuleSet::new(alert_rules);
        self
    }
}

/// Thread-safe accessor for the current [`RuntimeConfig`].
pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Arc<RuntimeConfig>;
}

/// [`ConfigProvider`] whose snapshot can be swapped atomically while the pipeline runs.
#[derive(Debug, Default)]
pub struct SharedConfig {
    current: RwLock<Arc<RuntimeConfig>>,
}

impl SharedConfig {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Publish a new snapshot. Readers holding the previous one finish with it.
    pub fn replace(&self, config: RuntimeConfig) {
        *self.current.write() = Arc::new(config);
    }

    /// Copy-modify-publish the current snapshot.
    pub fn update<F>(&self, modify: F)
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let mut current = self.current.write();
        let mut next = RuntimeConfig::clone(&current);
        modify(&mut next);
        *current = Arc::new(next);
    }

    pub fn allow_symbol(&self, symbol: &str) {
        self.update(|config| {
            config
                .allowed_symbols
                .insert(SmolStr::new(symbol.trim().to_uppercase()));
        });
    }

    pub fn disallow_symbol(&self, symbol: &str) {
        self.update(|config| {
            config
                .allowed_symbols
                .remove(symbol.trim().to_uppercase().as_str());
        });
    }
}

impl ConfigProvider for SharedConfig {
    fn snapshot(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.current.read())
    }
}

/// Serde adapter representing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
