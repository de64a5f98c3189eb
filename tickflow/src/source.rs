//! Ingestion source supervision.
//!
//! Sources are registered explicitly in a [`SourceRegistry`] and each runs in its own task.
//! A source reports typed [`SourceEvent`]s over a channel rather than invoking callbacks, and
//! writes ticks through [`SourceContext::emit`], which consults the shared [`CursorStore`] so a
//! WebSocket stream and a REST poller of one exchange never both deliver the same trade.

use crate::{
    cursor::CursorStore,
    error::SourceError,
    monitoring::MonitoringEngine,
    pipeline::TickSender,
    tick::Tick,
};
use async_trait::async_trait;
use chrono::Utc;
use derive_more::Display;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producer of [`Tick`]s for one exchange over one transport.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Feed identity, eg/ `binance-ws`.
    fn name(&self) -> &str;

    /// Exchange identity, shared by every feed of the same exchange.
    fn exchange(&self) -> &str;

    /// Run until `ctx` is cancelled or the source fails.
    async fn run(&self, ctx: SourceContext) -> Result<(), SourceError>;
}

/// Connection status reported by a running source.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SourceStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Message from a source task to the [`SourceSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Status { feed: SmolStr, status: SourceStatus },
    Finished { feed: SmolStr },
    Failed { feed: SmolStr, error: SourceError },
}

/// Handle given to a running [`TickSource`].
#[derive(Debug, Clone)]
pub struct SourceContext {
    feed: SmolStr,
    exchange: SmolStr,
    sender: TickSender,
    cursor: Arc<CursorStore>,
    events: mpsc::UnboundedSender<SourceEvent>,
    cancel: CancellationToken,
}

impl SourceContext {
    pub fn new(
        feed: impl Into<SmolStr>,
        exchange: impl Into<SmolStr>,
        sender: TickSender,
        cursor: Arc<CursorStore>,
        events: mpsc::UnboundedSender<SourceEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            feed: feed.into(),
            exchange: exchange.into(),
            sender,
            cursor,
            events,
            cancel,
        }
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Gate the tick on the cursor, send it, then mark it emitted.
    ///
    /// Returns `Ok(false)` if the cursor rejected the tick as already emitted by another
    /// transport or as older than the watermark.
    ///
    /// Gate and mark are separate steps on the shared [`CursorStore`]: two transports racing
    /// on the same new trade can both pass the gate, and the conditioner's dedup drops the
    /// second copy.
    pub async fn emit(&self, tick: Tick) -> Result<bool, SourceError> {
        let tick = tick.with_feed(self.feed.clone());

        if !self.cursor.should_emit_tick(&tick) {
            return Ok(false);
        }

        self.sender
            .send(tick.clone())
            .await
            .map_err(|_| SourceError::PipelineClosed(self.feed.to_string()))?;

        self.cursor.mark_tick(&tick);

        Ok(true)
    }

    pub fn status(&self, status: SourceStatus) {
        let _ = self.events.send(SourceEvent::Status {
            feed: self.feed.clone(),
            status,
        });
    }
}

/// Explicit, compiled list of sources to run.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn TickSource>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|source| source.name()))
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source<S>(mut self, source: S) -> Self
    where
        S: TickSource + 'static,
    {
        self.register(Arc::new(source));
        self
    }

    pub fn register(&mut self, source: Arc<dyn TickSource>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TickSource>> {
        self.sources.iter()
    }
}

/// Shared collaborators every supervised source is wired to.
#[derive(Debug, Clone)]
pub struct SourceDeps {
    pub sender: TickSender,
    pub cursor: Arc<CursorStore>,
    pub monitoring: Arc<MonitoringEngine>,
    pub cancel: CancellationToken,
}

/// Runs every registered source in its own task. A source that returns an error or panics is
/// marked offline in the [`MonitoringEngine`] without affecting the others.
#[derive(Debug)]
pub struct SourceSupervisor {
    cancel: CancellationToken,
    sources: Vec<JoinHandle<()>>,
    events: JoinHandle<()>,
}

impl SourceSupervisor {
    pub fn spawn(registry: SourceRegistry, deps: SourceDeps) -> Self {
        let SourceDeps {
            sender,
            cursor,
            monitoring,
            cancel,
        } = deps;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let sources = registry
            .iter()
            .map(|source| {
                let feed = SmolStr::new(source.name());
                monitoring.register_source(&feed, source.exchange(), Utc::now());

                let ctx = SourceContext::new(
                    feed.clone(),
                    source.exchange(),
                    sender.clone(),
                    Arc::clone(&cursor),
                    events_tx.clone(),
                    cancel.child_token(),
                );
                let events = events_tx.clone();
                let source = Arc::clone(source);

                tokio::spawn(async move {
                    info!(%feed, exchange = %source.exchange(), "source starting");
                    let outcome = AssertUnwindSafe(source.run(ctx)).catch_unwind().await;

                    let event = match outcome {
                        Ok(Ok(())) => SourceEvent::Finished { feed },
                        Ok(Err(error)) => SourceEvent::Failed { feed, error },
                        Err(_) => SourceEvent::Failed {
                            error: SourceError::Panicked(feed.to_string()),
                            feed,
                        },
                    };
                    let _ = events.send(event);
                })
            })
            .collect();

        // Only source tasks & contexts hold senders, so the event loop ends with them
        drop(events_tx);
        drop(sender);

        Self {
            cancel,
            sources,
            events: tokio::spawn(handle_events(events_rx, monitoring)),
        }
    }

    /// Cancel every source and wait for them, and the event loop, to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for every source to finish on its own.
    pub async fn join(self) {
        for source in self.sources {
            if let Err(error) = source.await {
                error!(?error, "source task failed to join");
            }
        }
        if let Err(error) = self.events.await {
            error!(?error, "source event loop failed to join");
        }
    }
}

async fn handle_events(
    mut events: mpsc::UnboundedReceiver<SourceEvent>,
    monitoring: Arc<MonitoringEngine>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SourceEvent::Status { feed, status } => {
                debug!(%feed, %status, "source status");
                monitoring.set_online(&feed, status == SourceStatus::Connected);
            }
            SourceEvent::Finished { feed } => {
                info!(%feed, "source finished");
                monitoring.set_online(&feed, false);
            }
            SourceEvent::Failed { feed, error } => {
                warn!(%feed, %error, "source failed, marked offline");
                monitoring.set_online(&feed, false);
            }
        }
    }
}
