use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tickflow::{
    error::SourceError,
    source::{SourceContext, SourceStatus, TickSource},
    tick::Tick,
};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Deterministic trade tape of one synthetic exchange.
///
/// Trade `n` is generated from `n` alone, so a stream and a poller reading the same tape
/// deliver identical trades, as two transports of a real exchange would.
#[derive(Debug)]
pub struct SyntheticTape {
    exchange: SmolStr,
    symbols: Vec<SmolStr>,
    spacing: Duration,
    started: DateTime<Utc>,
}

impl SyntheticTape {
    pub fn new<I, S>(exchange: &str, symbols: I, spacing: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            exchange: SmolStr::new(exchange),
            symbols: symbols
                .into_iter()
                .map(|symbol| SmolStr::new(symbol.as_ref().to_uppercase()))
                .collect(),
            spacing: spacing.max(Duration::from_millis(1)),
            started: Utc::now(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Id of the next trade that has not happened yet.
    pub fn head(&self) -> u64 {
        let elapsed = (Utc::now() - self.started).num_milliseconds().max(0) as u64;
        elapsed / self.spacing.as_millis().max(1) as u64
    }

    pub fn trade(&self, id: u64) -> Option<Tick> {
        let symbol = self.symbols.get(id as usize % self.symbols.len().max(1))?;
        let mut rng = StdRng::seed_from_u64(id);

        let base = base_price(symbol);
        let bps = Decimal::new(rng.random_range(-50..=50), 4);
        let price = (base + base * bps).round_dp(2);
        let volume = Decimal::new(rng.random_range(1..=2_000), 3);

        let offset = TimeDelta::milliseconds((id as u128 * self.spacing.as_millis()) as i64);

        Some(
            Tick::new(
                self.exchange.clone(),
                symbol.clone(),
                price,
                volume,
                self.started + offset,
            )
            .with_trade_id(id.to_string()),
        )
    }
}

fn base_price(symbol: &str) -> Decimal {
    match symbol {
        "BTCUSDT" => Decimal::from(65_000),
        "ETHUSDT" => Decimal::from(3_200),
        "SOLUSDT" => Decimal::from(150),
        "XRPUSDT" => Decimal::new(52, 2),
        _ => Decimal::ONE_HUNDRED,
    }
}

/// Streaming transport: emits every trade as it happens, but occasionally disconnects and
/// misses the trades of the outage.
#[derive(Debug)]
pub struct SyntheticStream {
    name: SmolStr,
    tape: Arc<SyntheticTape>,
    disconnect_probability: f64,
    reconnect_delay: Duration,
}

impl SyntheticStream {
    pub fn new(name: &str, tape: Arc<SyntheticTape>) -> Self {
        Self {
            name: SmolStr::new(name),
            tape,
            disconnect_probability: 0.002,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl TickSource for SyntheticStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn exchange(&self) -> &str {
        self.tape.exchange()
    }

    async fn run(&self, ctx: SourceContext) -> Result<(), SourceError> {
        ctx.status(SourceStatus::Connected);

        let mut next = self.tape.head();
        let mut ticker = interval(self.tape.spacing);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let disconnect = rand::rng().random_bool(self.disconnect_probability);
            if disconnect {
                info!(feed = %self.name, "synthetic stream disconnected");
                ctx.status(SourceStatus::Reconnecting);

                tokio::select! {
                    _ = ctx.cancel_token().cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                }

                // Trades during the outage are lost to this transport
                next = self.tape.head();
                ctx.status(SourceStatus::Connected);
                continue;
            }

            let head = self.tape.head();
            for id in next..head {
                if let Some(tick) = self.tape.trade(id) {
                    ctx.emit(tick).await?;
                }
            }
            next = next.max(head);
        }
    }
}

/// Polling transport: periodically fetches the most recent `depth` trades, most of which the
/// stream already delivered.
#[derive(Debug)]
pub struct SyntheticPoller {
    name: SmolStr,
    tape: Arc<SyntheticTape>,
    poll_interval: Duration,
    depth: u64,
}

impl SyntheticPoller {
    pub fn new(name: &str, tape: Arc<SyntheticTape>, poll_interval: Duration, depth: u64) -> Self {
        Self {
            name: SmolStr::new(name),
            tape,
            poll_interval,
            depth,
        }
    }
}

#[async_trait]
impl TickSource for SyntheticPoller {
    fn name(&self) -> &str {
        &self.name
    }

    fn exchange(&self) -> &str {
        self.tape.exchange()
    }

    async fn run(&self, ctx: SourceContext) -> Result<(), SourceError> {
        ctx.status(SourceStatus::Connected);

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let head = self.tape.head();
            let mut emitted = 0usize;
            for id in head.saturating_sub(self.depth)..head {
                if let Some(tick) = self.tape.trade(id) {
                    if ctx.emit(tick).await? {
                        emitted += 1;
                    }
                }
            }

            debug!(feed = %self.name, head, emitted, "synthetic poll complete");
        }
    }
}
