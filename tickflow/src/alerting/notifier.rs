use super::{Alert, Severity};
use crate::error::NotifyError;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Alert delivery channel. Implementations must be safe to call concurrently from every lane.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes alerts to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub const NAME: &'static str = "log";
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.severity {
            Severity::Info => info!(
                rule = %alert.rule,
                source = %alert.source,
                symbol = %alert.symbol,
                price = %alert.price,
                "{}", alert.message
            ),
            Severity::Warning | Severity::Critical => warn!(
                rule = %alert.rule,
                severity = %alert.severity,
                source = %alert.source,
                symbol = %alert.symbol,
                price = %alert.price,
                "{}", alert.message
            ),
        }
        Ok(())
    }
}

/// Forwards alerts to an in-process receiver.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    name: String,
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelNotifier {
    pub const NAME: &'static str = "channel";

    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        Self::named(Self::NAME)
    }

    pub fn named(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.tx
            .send(alert.clone())
            .map_err(|_| NotifyError::Disconnected(self.name.clone()))
    }
}

/// Explicit, ordered registry of notifiers addressed case-insensitively by name.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: IndexMap<String, Arc<dyn Notifier>>,
}

impl std::fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("notifiers", &self.notifiers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notifier, replacing any existing notifier of the same name in place.
    pub fn with_notifier<N>(mut self, notifier: N) -> Self
    where
        N: Notifier + 'static,
    {
        self.register(Arc::new(notifier));
        self
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers
            .insert(notifier.name().to_lowercase(), notifier);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Notifier>> {
        self.notifiers.get(&name.trim().to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.notifiers.keys().map(String::as_str)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Notifier>> {
        self.notifiers.values()
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}
