use super::{Alert, AlertRule, AlertRuleSet, Notifier, NotifierRegistry, build_rules};
use crate::{
    aggregation::MetricsSnapshot,
    config::{ConfigProvider, RuntimeConfig},
    error::{ConfigError, NotifyError},
    storage::Storage,
    tick::NormalizedTick,
};
use futures::{FutureExt, future::join_all};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Lifetime counters of an [`AlertingEngine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AlertingStats {
    pub alerts_raised: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub unknown_channels: u64,
    pub persist_failures: u64,
}

#[derive(Debug, Default)]
struct AlertingCounters {
    alerts_raised: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    unknown_channels: AtomicU64,
    persist_failures: AtomicU64,
}

/// Rules built from the alert rule configs of one [`RuntimeConfig`] snapshot.
struct ConfiguredRules {
    snapshot: Arc<RuntimeConfig>,
    rules: Arc<[Arc<dyn AlertRule>]>,
}

/// Evaluates enabled rules per tick, persists each alert and delivers it to its resolved
/// notifiers. Shared across lanes by `Arc`.
///
/// Channel resolution, first non-empty wins:
/// 1. `channels` of the most specific config matching rule, source & symbol.
/// 2. `channels` of the reserved global record.
/// 3. Every registered notifier.
///
/// Every notifier invocation is isolated: an error or panic is logged and counted, and never
/// prevents delivery to other notifiers or evaluation of later rules.
pub struct AlertingEngine {
    rules: Vec<Arc<dyn AlertRule>>,
    configured: Option<RwLock<ConfiguredRules>>,
    notifiers: NotifierRegistry,
    config: Arc<dyn ConfigProvider>,
    storage: Option<Arc<dyn Storage>>,
    permits: Option<Arc<Semaphore>>,
    counters: AlertingCounters,
}

impl std::fmt::Debug for AlertingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertingEngine")
            .field("rules", &self.rules)
            .field(
                "configured_rules",
                &self.configured.as_ref().map(|configured| configured.read().rules.len()),
            )
            .field("notifiers", &self.notifiers)
            .field(
                "concurrency",
                &self.permits.as_ref().map(|permits| permits.available_permits()),
            )
            .field("stats", &self.stats())
            .finish()
    }
}

impl AlertingEngine {
    pub fn new(config: Arc<dyn ConfigProvider>, notifiers: NotifierRegistry) -> Self {
        Self {
            rules: Vec::new(),
            configured: None,
            notifiers,
            config,
            storage: None,
            permits: None,
            counters: AlertingCounters::default(),
        }
    }

    /// Construct an engine running every rule referenced by the alert rule configs of
    /// `config`. Unknown rules or unparseable parameters in the current snapshot are fatal.
    ///
    /// Rules are rebuilt whenever the provider publishes a new snapshot. A snapshot whose rules
    /// fail to build is logged and the previously built rules stay active.
    pub fn from_config(
        config: Arc<dyn ConfigProvider>,
        notifiers: NotifierRegistry,
    ) -> Result<Self, ConfigError> {
        let snapshot = config.snapshot();
        let rules = build_rules(snapshot.alert_rules())?;

        let mut engine = Self::new(config, notifiers);
        engine.configured = Some(RwLock::new(ConfiguredRules {
            snapshot,
            rules: rules.into(),
        }));

        Ok(engine)
    }

    /// Add rules evaluated regardless of the configured alert rules.
    pub fn with_rules<I>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn AlertRule>>,
    {
        self.rules.extend(rules);
        self
    }

    pub fn with_rule<R>(mut self, rule: R) -> Self
    where
        R: AlertRule + 'static,
    {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Cap concurrent deliveries of this engine. `None` leaves delivery uncapped.
    pub fn with_concurrency(mut self, permits: Option<usize>) -> Self {
        self.permits = permits.map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        self
    }

    /// Every rule currently evaluated: explicitly added rules first, then configured rules.
    pub fn rules(&self) -> Vec<Arc<dyn AlertRule>> {
        let configured = self.configured_rules(&self.config.snapshot());
        self.rules
            .iter()
            .chain(configured.iter().flat_map(|rules| rules.iter()))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AlertingStats {
        AlertingStats {
            alerts_raised: self.counters.alerts_raised.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
            unknown_channels: self.counters.unknown_channels.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
        }
    }

    /// Evaluate every enabled rule against the tick, returning the raised alerts.
    pub async fn evaluate(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> Vec<Alert> {
        self.evaluate_with_permits(tick, metrics, None).await
    }

    /// As [`evaluate`](Self::evaluate), with deliveries capped by `permits` instead of the
    /// engine's own limit. The pipeline passes one semaphore shared by every lane.
    pub async fn evaluate_with_permits(
        &self,
        tick: &NormalizedTick,
        metrics: &MetricsSnapshot,
        permits: Option<&Semaphore>,
    ) -> Vec<Alert> {
        if self.rules.is_empty() && self.configured.is_none() {
            return Vec::new();
        }

        let config = self.config.snapshot();
        let rule_set = config.alert_rules();
        let configured = self.configured_rules(&config);
        let permits = permits.or(self.permits.as_deref());
        let mut raised = Vec::new();

        let rules = self
            .rules
            .iter()
            .chain(configured.iter().flat_map(|rules| rules.iter()));

        for rule in rules {
            if !rule_set.is_enabled(rule.name(), &tick.source, &tick.symbol) {
                continue;
            }
            if !rule.is_match(tick, metrics) {
                continue;
            }

            let alert = rule.create_alert(tick, metrics);
            self.counters.alerts_raised.fetch_add(1, Ordering::Relaxed);
            debug!(rule = %alert.rule, symbol = %alert.symbol, "alert raised");

            self.persist(&alert).await;

            let notifiers =
                self.resolve_notifiers(rule_set, rule.name(), &tick.source, &tick.symbol);
            self.deliver(&alert, &notifiers, permits).await;

            raised.push(alert);
        }

        raised
    }

    /// Rules built from `snapshot`, rebuilding them if it is not the snapshot they were last
    /// built from.
    fn configured_rules(
        &self,
        snapshot: &Arc<RuntimeConfig>,
    ) -> Option<Arc<[Arc<dyn AlertRule>]>> {
        let configured = self.configured.as_ref()?;

        {
            let current = configured.read();
            if Arc::ptr_eq(&current.snapshot, snapshot) {
                return Some(Arc::clone(&current.rules));
            }
        }

        let mut current = configured.write();
        if !Arc::ptr_eq(&current.snapshot, snapshot) {
            match build_rules(snapshot.alert_rules()) {
                Ok(rules) => {
                    info!(rules = rules.len(), "alert rules rebuilt after reconfiguration");
                    current.rules = rules.into();
                }
                Err(error) => {
                    error!(%error, "invalid alert rule reconfiguration, keeping previous rules");
                }
            }
            current.snapshot = Arc::clone(snapshot);
        }

        Some(Arc::clone(&current.rules))
    }

    /// Resolve the notifiers an alert of `rule_name` for `source` & `symbol` is delivered to.
    pub fn resolve_notifiers(
        &self,
        rule_set: &AlertRuleSet,
        rule_name: &str,
        source: &str,
        symbol: &str,
    ) -> Vec<Arc<dyn Notifier>> {
        let channels = rule_set
            .most_specific(rule_name, source, symbol)
            .and_then(|config| config.channels())
            .or_else(|| rule_set.global().and_then(|config| config.channels()));

        let Some(channels) = channels else {
            return self.notifiers.all().cloned().collect();
        };

        channels
            .iter()
            .filter_map(|channel| match self.notifiers.get(channel) {
                Some(notifier) => Some(Arc::clone(notifier)),
                None => {
                    self.counters.unknown_channels.fetch_add(1, Ordering::Relaxed);
                    warn!(%channel, rule = %rule_name, "unknown alert channel skipped");
                    None
                }
            })
            .collect()
    }

    async fn persist(&self, alert: &Alert) {
        let Some(storage) = &self.storage else {
            return;
        };

        if let Err(error) = storage.write_alert(alert).await {
            self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!(rule = %alert.rule, symbol = %alert.symbol, ?error, "failed to persist alert");
        }
    }

    async fn deliver(
        &self,
        alert: &Alert,
        notifiers: &[Arc<dyn Notifier>],
        permits: Option<&Semaphore>,
    ) {
        let _permit = match permits {
            Some(permits) => permits.acquire().await.ok(),
            None => None,
        };

        let results = join_all(notifiers.iter().map(|notifier| async move {
            let result = AssertUnwindSafe(notifier.notify(alert))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(NotifyError::Panicked(notifier.name().to_string())));
            (notifier.name(), result)
        }))
        .await;

        for (notifier, result) in results {
            match result {
                Ok(()) => {
                    self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    error!(%notifier, rule = %alert.rule, ?error, "alert delivery failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alerting::{AlertRuleConfig, ChannelNotifier, PriceThresholdRule},
        config::{RuntimeConfig, SharedConfig},
        storage::InMemoryStorage,
        tick::Tick,
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use smol_str::SmolStr;
    use std::time::Duration;

    #[derive(Debug)]
    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(&self, _: &Alert) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery {
                notifier: "failing".to_string(),
                reason: "smtp down".to_string(),
            })
        }
    }

    #[derive(Debug)]
    struct PanickingNotifier;

    #[async_trait]
    impl Notifier for PanickingNotifier {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn notify(&self, _: &Alert) -> Result<(), NotifyError> {
            panic!("notifier bug")
        }
    }

    fn tick(source: &str, price: rust_decimal::Decimal) -> NormalizedTick {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        NormalizedTick::from(
            Tick::new(source, "BTCUSDT", price, dec!(1), timestamp).with_trade_id("1"),
        )
    }

    fn metrics() -> MetricsSnapshot {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        MetricsSnapshot {
            source: SmolStr::new("binance"),
            symbol: SmolStr::new("BTCUSDT"),
            window_start: timestamp,
            window: Duration::from_secs(60),
            timestamp,
            average_price: dec!(100),
            volatility: dec!(0),
            count: 1,
            average_volume: dec!(1),
        }
    }

    fn threshold_rule() -> PriceThresholdRule {
        PriceThresholdRule {
            above: Some(dec!(100)),
            below: None,
        }
    }

    fn config(rules: Vec<AlertRuleConfig>) -> Arc<SharedConfig> {
        Arc::new(SharedConfig::new(RuntimeConfig::new(["BTCUSDT"], rules)))
    }

    #[tokio::test]
    async fn test_failing_notifier_is_isolated() {
        let (channel, mut rx) = ChannelNotifier::new();
        let storage = Arc::new(InMemoryStorage::new());
        let registry = NotifierRegistry::new()
            .with_notifier(FailingNotifier)
            .with_notifier(PanickingNotifier)
            .with_notifier(channel);

        let engine = AlertingEngine::new(config(vec![]), registry)
            .with_rule(threshold_rule())
            .with_storage(storage.clone())
            .with_concurrency(Some(1));

        let raised = engine.evaluate(&tick("binance", dec!(101)), &metrics()).await;

        assert_eq!(raised.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), raised[0]);
        assert_eq!(storage.alerts(), raised);

        let stats = engine.stats();
        assert_eq!(stats.alerts_raised, 1);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.delivery_failures, 2);
    }

    #[tokio::test]
    async fn test_channel_resolution_precedence() {
        let (log, _log_rx) = ChannelNotifier::named("log");
        let (email, _email_rx) = ChannelNotifier::named("email");
        let (slack, _slack_rx) = ChannelNotifier::named("slack");
        let registry = NotifierRegistry::new()
            .with_notifier(log)
            .with_notifier(email)
            .with_notifier(slack);

        struct TestCase {
            configs: Vec<AlertRuleConfig>,
            source: &'static str,
            expected: Vec<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: nothing configured broadcasts to all
                configs: vec![],
                source: "binance",
                expected: vec!["log", "email", "slack"],
            },
            TestCase {
                // TC1: global record
                configs: vec![AlertRuleConfig::global().with_parameter("channels", "email")],
                source: "binance",
                expected: vec!["email"],
            },
            TestCase {
                // TC2: rule config beats global record
                configs: vec![
                    AlertRuleConfig::global().with_parameter("channels", "email"),
                    AlertRuleConfig::new("price_threshold")
                        .with_exchange("binance")
                        .with_parameter("channels", "slack,log"),
                ],
                source: "binance",
                expected: vec!["slack", "log"],
            },
            TestCase {
                // TC3: rule config without channels falls through to global record
                configs: vec![
                    AlertRuleConfig::global().with_parameter("channels", "email"),
                    AlertRuleConfig::new("price_threshold").with_exchange("okx"),
                ],
                source: "okx",
                expected: vec!["email"],
            },
            TestCase {
                // TC4: unknown channel skipped
                configs: vec![AlertRuleConfig::global().with_parameter("channels", "pager,log")],
                source: "binance",
                expected: vec!["log"],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let config = config(test.configs);
            let engine = AlertingEngine::new(config.clone(), registry.clone());
            let snapshot = config.snapshot();

            let actual = engine
                .resolve_notifiers(
                    snapshot.alert_rules(),
                    "price_threshold",
                    test.source,
                    "BTCUSDT",
                )
                .iter()
                .map(|notifier| notifier.name().to_string())
                .collect::<Vec<_>>();

            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_configured_rules_follow_reconfiguration() {
        let shared = config(vec![
            AlertRuleConfig::new("price_threshold").with_parameter("above", "100"),
        ]);
        let (channel, _rx) = ChannelNotifier::new();
        let registry = NotifierRegistry::new().with_notifier(channel);
        let engine = AlertingEngine::from_config(shared.clone(), registry).unwrap();

        let rule_names = |raised: Vec<Alert>| {
            raised
                .into_iter()
                .map(|alert| alert.rule.to_string())
                .collect::<Vec<_>>()
        };

        let raised = engine.evaluate(&tick("binance", dec!(150)), &metrics()).await;
        assert_eq!(rule_names(raised), vec!["price_threshold"]);

        // Raised threshold applies to the next tick, and a newly configured rule is picked up
        shared.replace(RuntimeConfig::new(
            ["BTCUSDT"],
            vec![
                AlertRuleConfig::new("price_threshold").with_parameter("above", "200"),
                AlertRuleConfig::new("volatility")
                    .with_parameter("max_volatility", "0")
                    .with_parameter("min_samples", "1"),
            ],
        ));
        let raised = engine.evaluate(&tick("binance", dec!(150)), &metrics()).await;
        assert_eq!(rule_names(raised), vec!["volatility"]);

        // Invalid reconfiguration keeps the previously built rules
        shared.replace(RuntimeConfig::new(
            ["BTCUSDT"],
            vec![AlertRuleConfig::new("price_threshold").with_parameter("above", "lots")],
        ));
        let raised = engine.evaluate(&tick("binance", dec!(250)), &metrics()).await;
        assert_eq!(rule_names(raised), vec!["price_threshold", "volatility"]);
        assert_eq!(engine.rules().len(), 2);
    }

    #[test]
    fn test_from_config_rejects_invalid_rules() {
        let shared = config(vec![AlertRuleConfig::new("unheard_of")]);
        assert!(matches!(
            AlertingEngine::from_config(shared, NotifierRegistry::new()),
            Err(ConfigError::UnknownRule(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_rule_is_skipped() {
        let config = config(vec![
            AlertRuleConfig::new("price_threshold")
                .with_exchange("okx")
                .with_enabled(false),
        ]);
        let (channel, mut rx) = ChannelNotifier::new();
        let engine = AlertingEngine::new(config, NotifierRegistry::new().with_notifier(channel))
            .with_rule(threshold_rule());

        assert!(engine.evaluate(&tick("okx", dec!(150)), &metrics()).await.is_empty());
        assert_eq!(engine.evaluate(&tick("binance", dec!(150)), &metrics()).await.len(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
