use super::{Alert, AlertRuleSet, CHANNELS_PARAMETER, Severity};
use crate::{aggregation::MetricsSnapshot, error::ConfigError, tick::NormalizedTick};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{collections::BTreeMap, fmt::Debug, str::FromStr, sync::Arc};

/// Condition evaluated against every conditioned tick and its rolling metrics.
pub trait AlertRule: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn is_match(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> bool;

    fn create_alert(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> Alert;
}

fn alert(
    rule: &str,
    tick: &NormalizedTick,
    severity: Severity,
    message: String,
) -> Alert {
    Alert {
        rule: SmolStr::new(rule),
        source: tick.source.clone(),
        symbol: tick.symbol.clone(),
        message,
        price: tick.price,
        severity,
        timestamp: tick.timestamp,
        fingerprint: tick.fingerprint.clone(),
    }
}

struct Parameters<'a> {
    rule: &'static str,
    inner: &'a BTreeMap<String, String>,
}

impl Parameters<'_> {
    fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.inner.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidRuleParameter {
                    rule: self.rule.to_string(),
                    parameter: key.to_string(),
                    value: raw.clone(),
                }),
            None => Ok(None),
        }
    }

    fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.get(key).map(|value| value.unwrap_or(default))
    }

    fn required<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        self.get(key)?.ok_or_else(|| self.missing(key))
    }

    fn missing(&self, key: &str) -> ConfigError {
        ConfigError::InvalidRuleParameter {
            rule: self.rule.to_string(),
            parameter: key.to_string(),
            value: String::new(),
        }
    }

    fn check_known(&self, known: &[&str]) -> Result<(), ConfigError> {
        match self
            .inner
            .iter()
            .find(|(key, _)| key.as_str() != CHANNELS_PARAMETER && !known.contains(&key.as_str()))
        {
            Some((key, value)) => Err(ConfigError::InvalidRuleParameter {
                rule: self.rule.to_string(),
                parameter: key.clone(),
                value: value.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Fires when price deviates from the rolling average by at least `threshold_pct` percent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSpikeRule {
    pub threshold_pct: Decimal,
    pub min_samples: u64,
}

impl PriceSpikeRule {
    pub const NAME: &'static str = "price_spike";

    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let parameters = Parameters {
            rule: Self::NAME,
            inner: parameters,
        };
        parameters.check_known(&["threshold_pct", "min_samples"])?;

        Ok(Self {
            threshold_pct: parameters.get_or("threshold_pct", Decimal::TWO)?,
            min_samples: parameters.get_or("min_samples", 10)?,
        })
    }

    fn deviation_pct(tick: &NormalizedTick, metrics: &MetricsSnapshot) -> Option<Decimal> {
        (!metrics.average_price.is_zero()).then(|| {
            (tick.price - metrics.average_price).abs() / metrics.average_price
                * Decimal::ONE_HUNDRED
        })
    }
}

impl AlertRule for PriceSpikeRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_match(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> bool {
        metrics.count >= self.min_samples
            && Self::deviation_pct(tick, metrics).is_some_and(|pct| pct >= self.threshold_pct)
    }

    fn create_alert(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> Alert {
        let deviation = Self::deviation_pct(tick, metrics).unwrap_or_default();
        let severity = if deviation >= self.threshold_pct * Decimal::TWO {
            Severity::Critical
        } else {
            Severity::Warning
        };

        alert(
            Self::NAME,
            tick,
            severity,
            format!(
                "{} {} price {} deviates {}% from {}s average {}",
                tick.source,
                tick.symbol,
                tick.price,
                deviation.round_dp(2),
                metrics.window.as_secs(),
                metrics.average_price.round_dp(8),
            ),
        )
    }
}

/// Fires when a tick's volume is at least `multiplier` times the rolling average volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpikeRule {
    pub multiplier: Decimal,
    pub min_samples: u64,
}

impl VolumeSpikeRule {
    pub const NAME: &'static str = "volume_spike";

    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let parameters = Parameters {
            rule: Self::NAME,
            inner: parameters,
        };
        parameters.check_known(&["multiplier", "min_samples"])?;

        Ok(Self {
            multiplier: parameters.get_or("multiplier", Decimal::from(5))?,
            min_samples: parameters.get_or("min_samples", 10)?,
        })
    }
}

impl AlertRule for VolumeSpikeRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_match(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> bool {
        metrics.count >= self.min_samples
            && metrics.average_volume > Decimal::ZERO
            && tick.volume >= metrics.average_volume * self.multiplier
    }

    fn create_alert(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> Alert {
        alert(
            Self::NAME,
            tick,
            Severity::Warning,
            format!(
                "{} {} volume {} is {}x the {}s average {}",
                tick.source,
                tick.symbol,
                tick.volume,
                (tick.volume / metrics.average_volume).round_dp(2),
                metrics.window.as_secs(),
                metrics.average_volume.round_dp(8),
            ),
        )
    }
}

/// Fires when price crosses above `above` or below `below`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceThresholdRule {
    pub above: Option<Decimal>,
    pub below: Option<Decimal>,
}

impl PriceThresholdRule {
    pub const NAME: &'static str = "price_threshold";

    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let parameters = Parameters {
            rule: Self::NAME,
            inner: parameters,
        };
        parameters.check_known(&["above", "below"])?;

        let rule = Self {
            above: parameters.get("above")?,
            below: parameters.get("below")?,
        };

        if rule.above.is_none() && rule.below.is_none() {
            return Err(parameters.missing("above|below"));
        }

        Ok(rule)
    }
}

impl AlertRule for PriceThresholdRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_match(&self, tick: &NormalizedTick, _: &MetricsSnapshot) -> bool {
        self.above.is_some_and(|above| tick.price > above)
            || self.below.is_some_and(|below| tick.price < below)
    }

    fn create_alert(&self, tick: &NormalizedTick, _: &MetricsSnapshot) -> Alert {
        let message = match (self.above, self.below) {
            (Some(above), _) if tick.price > above => {
                format!("{} {} price {} above {}", tick.source, tick.symbol, tick.price, above)
            }
            (_, Some(below)) => {
                format!("{} {} price {} below {}", tick.source, tick.symbol, tick.price, below)
            }
            _ => format!("{} {} price {} crossed threshold", tick.source, tick.symbol, tick.price),
        };

        alert(Self::NAME, tick, Severity::Info, message)
    }
}

/// Fires when rolling price volatility reaches `max_volatility`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatilityRule {
    pub max_volatility: Decimal,
    pub min_samples: u64,
}

impl VolatilityRule {
    pub const NAME: &'static str = "volatility";

    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let parameters = Parameters {
            rule: Self::NAME,
            inner: parameters,
        };
        parameters.check_known(&["max_volatility", "min_samples"])?;

        Ok(Self {
            max_volatility: parameters.required("max_volatility")?,
            min_samples: parameters.get_or("min_samples", 2)?,
        })
    }
}

impl AlertRule for VolatilityRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_match(&self, _: &NormalizedTick, metrics: &MetricsSnapshot) -> bool {
        metrics.count >= self.min_samples && metrics.volatility >= self.max_volatility
    }

    fn create_alert(&self, tick: &NormalizedTick, metrics: &MetricsSnapshot) -> Alert {
        alert(
            Self::NAME,
            tick,
            Severity::Warning,
            format!(
                "{} {} {}s volatility {} reached {}",
                tick.source,
                tick.symbol,
                metrics.window.as_secs(),
                metrics.volatility.round_dp(8),
                self.max_volatility,
            ),
        )
    }
}

/// Construct every rule referenced by `rules`, using the parameters of each rule's least
/// specific config. Unknown rule names and unparseable parameters are fatal.
pub fn build_rules(rules: &AlertRuleSet) -> Result<Vec<Arc<dyn AlertRule>>, ConfigError> {
    rules
        .rule_names()
        .into_iter()
        .map(|name| {
            let parameters = rules
                .base_config(&name)
                .map(|config| config.parameters.clone())
                .unwrap_or_default();

            let rule: Arc<dyn AlertRule> = match name.as_str() {
                PriceSpikeRule::NAME => Arc::new(PriceSpikeRule::from_parameters(&parameters)?),
                VolumeSpikeRule::NAME => Arc::new(VolumeSpikeRule::from_parameters(&parameters)?),
                PriceThresholdRule::NAME => {
                    Arc::new(PriceThresholdRule::from_parameters(&parameters)?)
                }
                VolatilityRule::NAME => Arc::new(VolatilityRule::from_parameters(&parameters)?),
                _ => return Err(ConfigError::UnknownRule(name)),
            };

            Ok(rule)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alerting::AlertRuleConfig, tick::Tick};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn tick(price: Decimal, volume: Decimal) -> NormalizedTick {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        NormalizedTick::from(Tick::new("binance", "BTCUSDT", price, volume, timestamp))
    }

    fn metrics(
        average_price: Decimal,
        average_volume: Decimal,
        volatility: Decimal,
        count: u64,
    ) -> MetricsSnapshot {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        MetricsSnapshot {
            source: SmolStr::new("binance"),
            symbol: SmolStr::new("BTCUSDT"),
            window_start: timestamp,
            window: Duration::from_secs(60),
            timestamp,
            average_price,
            volatility,
            count,
            average_volume,
        }
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_price_spike_rule() {
        let rule = PriceSpikeRule::from_parameters(&params(&[
            ("threshold_pct", "5"),
            ("min_samples", "3"),
        ]))
        .unwrap();

        struct TestCase {
            price: Decimal,
            count: u64,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: within threshold
                price: dec!(104),
                count: 10,
                expected: false,
            },
            TestCase {
                // TC1: exactly on threshold
                price: dec!(95),
                count: 10,
                expected: true,
            },
            TestCase {
                // TC2: not enough samples
                price: dec!(150),
                count: 2,
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = rule.is_match(
                &tick(test.price, dec!(1)),
                &metrics(dec!(100), dec!(1), dec!(0), test.count),
            );
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }

        let alert = rule.create_alert(
            &tick(dec!(111), dec!(1)),
            &metrics(dec!(100), dec!(1), dec!(0), 10),
        );
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.rule, "price_spike");
    }

    #[test]
    fn test_volume_spike_rule() {
        let rule = VolumeSpikeRule::from_parameters(&params(&[("multiplier", "3")])).unwrap();

        assert!(rule.is_match(&tick(dec!(1), dec!(30)), &metrics(dec!(1), dec!(10), dec!(0), 10)));
        assert!(!rule.is_match(&tick(dec!(1), dec!(29)), &metrics(dec!(1), dec!(10), dec!(0), 10)));
        assert!(!rule.is_match(&tick(dec!(1), dec!(30)), &metrics(dec!(1), dec!(10), dec!(0), 9)));
    }

    #[test]
    fn test_price_threshold_rule() {
        let rule = PriceThresholdRule::from_parameters(&params(&[
            ("above", "70000"),
            ("below", "50000"),
        ]))
        .unwrap();
        let metrics = metrics(dec!(1), dec!(1), dec!(0), 1);

        assert!(rule.is_match(&tick(dec!(70000.01), dec!(1)), &metrics));
        assert!(rule.is_match(&tick(dec!(49999), dec!(1)), &metrics));
        assert!(!rule.is_match(&tick(dec!(60000), dec!(1)), &metrics));

        let alert = rule.create_alert(&tick(dec!(49999), dec!(1)), &metrics);
        assert_eq!(alert.message, "binance BTCUSDT price 49999 below 50000");
    }

    #[test]
    fn test_volatility_rule() {
        let rule = VolatilityRule::from_parameters(&params(&[("max_volatility", "12.5")])).unwrap();

        assert!(rule.is_match(&tick(dec!(1), dec!(1)), &metrics(dec!(1), dec!(1), dec!(12.5), 5)));
        assert!(!rule.is_match(&tick(dec!(1), dec!(1)), &metrics(dec!(1), dec!(1), dec!(12.4), 5)));
    }

    #[test]
    fn test_rule_parameter_errors() {
        struct TestCase {
            input: Result<(), ConfigError>,
            expected_parameter: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: unparseable decimal
                input: PriceSpikeRule::from_parameters(&params(&[("threshold_pct", "lots")]))
                    .map(drop),
                expected_parameter: "threshold_pct",
            },
            TestCase {
                // TC1: threshold rule without any bound
                input: PriceThresholdRule::from_parameters(&params(&[])).map(drop),
                expected_parameter: "above|below",
            },
            TestCase {
                // TC2: volatility requires a bound
                input: VolatilityRule::from_parameters(&params(&[])).map(drop),
                expected_parameter: "max_volatility",
            },
            TestCase {
                // TC3: unknown parameter
                input: VolumeSpikeRule::from_parameters(&params(&[("multipler", "3")])).map(drop),
                expected_parameter: "multipler",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            match test.input {
                Err(ConfigError::InvalidRuleParameter { parameter, .. }) => {
                    assert_eq!(parameter, test.expected_parameter, "TC{} failed", index)
                }
                other => panic!("TC{index} failed: {other:?}"),
            }
        }
    }

    #[test]
    fn test_build_rules() {
        let set = AlertRuleSet::new(vec![
            AlertRuleConfig::global().with_parameter("channels", "log"),
            AlertRuleConfig::new("price_spike").with_parameter("threshold_pct", "1.5"),
            AlertRuleConfig::new("price_spike")
                .with_exchange("okx")
                .with_parameter("channels", "email"),
            AlertRuleConfig::new("volatility").with_parameter("max_volatility", "10"),
        ]);

        let rules = build_rules(&set).unwrap();
        let names = rules.iter().map(|rule| rule.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["price_spike", "volatility"]);

        let unknown = AlertRuleSet::new(vec![AlertRuleConfig::new("moon_shot")]);
        assert_eq!(
            build_rules(&unknown).unwrap_err(),
            ConfigError::UnknownRule("moon_shot".to_string())
        );
    }
}
