use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, collections::BTreeMap};

/// Reserved rule name of the configuration record holding global defaults (eg/ `channels`).
pub const GLOBAL_RULE_NAME: &str = "global";

/// Parameter key holding a CSV list of notifier channel names.
pub const CHANNELS_PARAMETER: &str = "channels";

/// Operator supplied configuration of one alert rule, optionally scoped to an exchange and/or a
/// set of symbols.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AlertRuleConfig {
    pub rule_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/// How narrowly an [`AlertRuleConfig`] is scoped. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Specificity {
    Global,
    Exchange,
    Symbols,
    ExchangeAndSymbols,
}

impl AlertRuleConfig {
    pub fn new(rule_name: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            enabled: true,
            exchange: None,
            symbols: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Construct the reserved global configuration record.
    pub fn global() -> Self {
        Self::new(GLOBAL_RULE_NAME)
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_global_record(&self) -> bool {
        self.rule_name.eq_ignore_ascii_case(GLOBAL_RULE_NAME)
    }

    pub fn specificity(&self) -> Specificity {
        match (self.exchange.is_some(), self.symbols.is_some()) {
            (true, true) => Specificity::ExchangeAndSymbols,
            (false, true) => Specificity::Symbols,
            (true, false) => Specificity::Exchange,
            (false, false) => Specificity::Global,
        }
    }

    /// Determine if this config's scope covers the provided source exchange and symbol.
    pub fn applies_to(&self, source: &str, symbol: &str) -> bool {
        let exchange_matches = self
            .exchange
            .as_deref()
            .is_none_or(|exchange| exchange.trim().eq_ignore_ascii_case(source.trim()));

        let symbol_matches = self.symbols.as_ref().is_none_or(|symbols| {
            symbols
                .iter()
                .any(|candidate| candidate.trim().eq_ignore_ascii_case(symbol.trim()))
        });

        exchange_matches && symbol_matches
    }

    /// Parse the CSV `channels` parameter into lower-cased channel names.
    ///
    /// Returns `None` when the parameter is absent or lists no channel, so resolution falls
    /// through to the next precedence level.
    pub fn channels(&self) -> Option<Vec<String>> {
        let channels = self
            .parameters
            .get(CHANNELS_PARAMETER)?
            .split(',')
            .map(|channel| channel.trim().to_lowercase())
            .filter(|channel| !channel.is_empty())
            .unique()
            .collect::<Vec<_>>();

        (!channels.is_empty()).then_some(channels)
    }

    fn ordering_key(
        &self,
    ) -> (
        Reverse<Specificity>,
        String,
        String,
        String,
        bool,
        BTreeMap<String, String>,
    ) {
        let exchange = self
            .exchange
            .as_deref()
            .map(|exchange| exchange.trim().to_lowercase())
            .unwrap_or_default();

        let symbols = self
            .symbols
            .iter()
            .flatten()
            .map(|symbol| symbol.trim().to_uppercase())
            .sorted()
            .join(",");

        (
            Reverse(self.specificity()),
            exchange,
            symbols,
            self.rule_name.to_lowercase(),
            self.enabled,
            self.parameters.clone(),
        )
    }
}

/// Immutable, deterministically ordered set of [`AlertRuleConfig`]s.
///
/// Configs are sorted most specific first, then by a content derived key, so selection never
/// depends on the order records were loaded or reconfigured in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertRuleSet {
    configs: Vec<AlertRuleConfig>,
}

impl AlertRuleSet {
    pub fn new<I>(configs: I) -> Self
    where
        I: IntoIterator<Item = AlertRuleConfig>,
    {
        let configs = configs
            .into_iter()
            .sorted_by_cached_key(AlertRuleConfig::ordering_key)
            .collect();

        Self { configs }
    }

    pub fn configs(&self) -> &[AlertRuleConfig] {
        &self.configs
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Most specific non-global config of `rule_name` whose scope covers `source` & `symbol`.
    pub fn most_specific(
        &self,
        rule_name: &str,
        source: &str,
        symbol: &str,
    ) -> Option<&AlertRuleConfig> {
        self.configs.iter().find(|config| {
            !config.is_global_record()
                && config.rule_name.eq_ignore_ascii_case(rule_name)
                && config.applies_to(source, symbol)
        })
    }

    /// The reserved global configuration record, if present.
    pub fn global(&self) -> Option<&AlertRuleConfig> {
        self.configs.iter().find(|config| config.is_global_record())
    }

    /// Least specific config of `rule_name`, used to source rule construction parameters.
    pub fn base_config(&self, rule_name: &str) -> Option<&AlertRuleConfig> {
        self.configs
            .iter()
            .rev()
            .find(|config| config.rule_name.eq_ignore_ascii_case(rule_name))
    }

    /// A rule without any matching config is enabled.
    pub fn is_enabled(&self, rule_name: &str, source: &str, symbol: &str) -> bool {
        self.most_specific(rule_name, source, symbol)
            .is_none_or(|config| config.enabled)
    }

    /// Names of all non-global rules referenced by this set, de-duplicated.
    pub fn rule_names(&self) -> Vec<String> {
        self.configs
            .iter()
            .filter(|config| !config.is_global_record())
            .map(|config| config.rule_name.to_lowercase())
            .unique()
            .sorted()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specificity() {
        struct TestCase {
            input: AlertRuleConfig,
            expected: Specificity,
        }

        let tests = vec![
            TestCase {
                // TC0: unscoped
                input: AlertRuleConfig::new("price_spike"),
                expected: Specificity::Global,
            },
            TestCase {
                // TC1: exchange only
                input: AlertRuleConfig::new("price_spike").with_exchange("binance"),
                expected: Specificity::Exchange,
            },
            TestCase {
                // TC2: symbols only
                input: AlertRuleConfig::new("price_spike").with_symbols(["BTCUSDT"]),
                expected: Specificity::Symbols,
            },
            TestCase {
                // TC3: both
                input: AlertRuleConfig::new("price_spike")
                    .with_exchange("binance")
                    .with_symbols(["BTCUSDT"]),
                expected: Specificity::ExchangeAndSymbols,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.input.specificity(), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_most_specific_precedence() {
        let configs = vec![
            AlertRuleConfig::new("price_spike").with_parameter("channels", "log"),
            AlertRuleConfig::new("price_spike")
                .with_exchange("Binance")
                .with_parameter("channels", "email"),
            AlertRuleConfig::new("price_spike")
                .with_symbols(["btcusdt"])
                .with_parameter("channels", "slack"),
        ];
        let set = AlertRuleSet::new(configs);

        // Symbol scope beats exchange scope
        let selected = set.most_specific("PRICE_SPIKE", "binance", "BTCUSDT").unwrap();
        assert_eq!(selected.channels(), Some(vec!["slack".to_string()]));

        // Exchange scope beats unscoped
        let selected = set.most_specific("price_spike", "binance", "ETHUSDT").unwrap();
        assert_eq!(selected.channels(), Some(vec!["email".to_string()]));

        // Unscoped fallback
        let selected = set.most_specific("price_spike", "okx", "ETHUSDT").unwrap();
        assert_eq!(selected.channels(), Some(vec!["log".to_string()]));

        assert!(set.most_specific("volume_spike", "okx", "ETHUSDT").is_none());
    }

    #[test]
    fn test_tie_break_is_independent_of_insertion_order() {
        let first = AlertRuleConfig::new("volume_spike")
            .with_symbols(["BTCUSDT", "ETHUSDT"])
            .with_parameter("channels", "a");
        let second = AlertRuleConfig::new("volume_spike")
            .with_symbols(["BTCUSDT"])
            .with_parameter("channels", "b");

        let forward = AlertRuleSet::new(vec![first.clone(), second.clone()]);
        let backward = AlertRuleSet::new(vec![second, first]);

        assert_eq!(forward, backward);
        assert_eq!(
            forward.most_specific("volume_spike", "okx", "BTCUSDT"),
            backward.most_specific("volume_spike", "okx", "BTCUSDT"),
        );
    }

    #[test]
    fn test_same_scope_tie_broken_by_parameters() {
        let email = AlertRuleConfig::new("price_spike")
            .with_exchange("binance")
            .with_parameter("channels", "email");
        let slack = AlertRuleConfig::new("price_spike")
            .with_exchange("binance")
            .with_parameter("channels", "slack");

        let forward = AlertRuleSet::new(vec![email.clone(), slack.clone()]);
        let backward = AlertRuleSet::new(vec![slack, email]);

        assert_eq!(forward, backward);

        let channels = |set: &AlertRuleSet| {
            set.most_specific("price_spike", "binance", "BTCUSDT")
                .and_then(AlertRuleConfig::channels)
        };
        assert_eq!(channels(&forward), channels(&backward));
        assert_eq!(channels(&forward), Some(vec!["email".to_string()]));
    }

    #[test]
    fn test_is_enabled() {
        let set = AlertRuleSet::new(vec![
            AlertRuleConfig::new("volatility"),
            AlertRuleConfig::new("volatility")
                .with_exchange("okx")
                .with_enabled(false),
        ]);

        assert!(set.is_enabled("volatility", "binance", "BTCUSDT"));
        assert!(!set.is_enabled("volatility", "okx", "BTCUSDT"));
        assert!(set.is_enabled("price_threshold", "okx", "BTCUSDT"));
    }

    #[test]
    fn test_channels_parsing() {
        struct TestCase {
            input: Option<&'static str>,
            expected: Option<Vec<&'static str>>,
        }

        let tests = vec![
            TestCase {
                // TC0: missing parameter
                input: None,
                expected: None,
            },
            TestCase {
                // TC1: blank parameter falls through
                input: Some(" , "),
                expected: None,
            },
            TestCase {
                // TC2: trimmed, lower-cased & de-duplicated
                input: Some(" Log, email ,LOG"),
                expected: Some(vec!["log", "email"]),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let config = match test.input {
                Some(channels) => AlertRuleConfig::global().with_parameter("channels", channels),
                None => AlertRuleConfig::global(),
            };
            let expected = test
                .expected
                .map(|channels| channels.into_iter().map(String::from).collect::<Vec<_>>());
            assert_eq!(config.channels(), expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_deserialise_alert_rule_config() {
        let input = r#"
            {
                "rule_name": "price_threshold",
                "exchange": "binance",
                "parameters": { "above": "70000" }
            }
        "#;

        let config = serde_json::from_str::<AlertRuleConfig>(input).unwrap();
        assert!(config.enabled);
        assert_eq!(config.specificity(), Specificity::Exchange);
        assert_eq!(config.parameters.get("above").map(String::as_str), Some("70000"));
    }
}
