use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

pub use config::{
    AlertRuleConfig, AlertRuleSet, CHANNELS_PARAMETER, GLOBAL_RULE_NAME, Specificity,
};
pub use engine::{AlertingEngine, AlertingStats};
pub use notifier::{ChannelNotifier, LogNotifier, Notifier, NotifierRegistry};
pub use rule::{
    AlertRule, PriceSpikeRule, PriceThresholdRule, VolatilityRule, VolumeSpikeRule, build_rules,
};

/// Scoped [`AlertRuleConfig`]s and precedence resolution.
pub mod config;

/// Rule evaluation, channel resolution & isolated delivery.
pub mod engine;

/// Delivery channels.
pub mod notifier;

/// Built-in [`AlertRule`]s.
pub mod rule;

#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub enum Severity {
    #[display("info")]
    Info,
    #[display("warning")]
    Warning,
    #[display("critical")]
    Critical,
}

/// Raised at most once per (rule, tick) match.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Alert {
    pub rule: SmolStr,
    pub source: SmolStr,
    pub symbol: SmolStr,
    pub message: String,
    pub price: Decimal,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    /// Fingerprint of the tick that triggered the alert.
    pub fingerprint: String,
}
