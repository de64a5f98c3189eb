//! Cross-transport dedup cursor shared by every ingestion source.
//!
//! When a WebSocket stream and a REST poller cover the same instrument, both consult the
//! [`CursorStore`] *before* writing to the pipeline's tick channel. The store keeps, per
//! (exchange, symbol):
//! - a monotonic `last_timestamp` watermark, enforced only for ticks without a trade id;
//! - a short-TTL cache of recently emitted fingerprints.
//!
//! Keys are spread over shards, each key guarded by its own lock, so WebSocket and REST tasks
//! only contend when they touch the same instrument.

use crate::{fingerprint::fingerprint, tick::Tick};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::{FnvHashMap, FnvHasher};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{
    collections::VecDeque,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

/// Default recent-fingerprint time-to-live.
pub const DEFAULT_CURSOR_TTL: Duration = Duration::from_secs(120);

const SHARD_COUNT: usize = 32;

/// Case-normalised (exchange, symbol) cursor key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorKey {
    pub exchange: SmolStr,
    pub symbol: SmolStr,
}

impl CursorKey {
    pub fn new(exchange: &str, symbol: &str) -> Self {
        Self {
            exchange: SmolStr::new(exchange.trim().to_lowercase()),
            symbol: SmolStr::new(symbol.trim().to_uppercase()),
        }
    }

    fn shard(&self) -> usize {
        let mut hasher = FnvHasher::default();
        self.hash(&mut hasher);
        (hasher.finish() % SHARD_COUNT as u64) as usize
    }
}

#[derive(Debug, Default)]
struct CursorState {
    last_timestamp: Option<DateTime<Utc>>,
    recent: FnvHashMap<String, DateTime<Utc>>,
    expiry: VecDeque<(String, DateTime<Utc>)>,
}

impl CursorState {
    fn evict(&mut self, now: DateTime<Utc>, ttl: TimeDelta) {
        while let Some((_, emitted_at)) = self.expiry.front() {
            if now - *emitted_at < ttl {
                break;
            }
            if let Some((fingerprint, emitted_at)) = self.expiry.pop_front() {
                if self.recent.get(&fingerprint) == Some(&emitted_at) {
                    self.recent.remove(&fingerprint);
                }
            }
        }
    }

    fn insert(&mut self, fingerprint: String, now: DateTime<Utc>) {
        self.recent.insert(fingerprint.clone(), now);
        self.expiry.push_back((fingerprint, now));
    }

    fn advance(&mut self, timestamp: DateTime<Utc>) {
        self.last_timestamp = Some(
            self.last_timestamp
                .map_or(timestamp, |last| last.max(timestamp)),
        );
    }
}

type Shard = RwLock<FnvHashMap<CursorKey, Arc<Mutex<CursorState>>>>;

/// Single cursor authority per (exchange, symbol) for all transports.
#[derive(Debug)]
pub struct CursorStore {
    ttl: TimeDelta,
    shards: Vec<Shard>,
}

impl Default for CursorStore {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_TTL)
    }
}

impl CursorStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::seconds(120)),
            shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
        }
    }

    /// Decide whether a tick may be written to the pipeline.
    ///
    /// Rejects a tick whose fingerprint was emitted within the TTL. Ticks without a trade id
    /// are additionally rejected when strictly older than the key's watermark. Ticks with a
    /// trade id ignore the watermark, since REST backfills legitimately deliver older ids.
    pub fn should_emit(
        &self,
        exchange: &str,
        symbol: &str,
        timestamp: DateTime<Utc>,
        trade_id: Option<&str>,
        price: Decimal,
        volume: Decimal,
    ) -> bool {
        self.should_emit_at(exchange, symbol, timestamp, trade_id, price, volume, Utc::now())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn should_emit_at(
        &self,
        exchange: &str,
        symbol: &str,
        timestamp: DateTime<Utc>,
        trade_id: Option<&str>,
        price: Decimal,
        volume: Decimal,
        now: DateTime<Utc>,
    ) -> bool {
        let key = CursorKey::new(exchange, symbol);
        let Some(cursor) = self.existing(&key) else {
            return true;
        };

        let fingerprint = fingerprint(exchange, symbol, timestamp, price, volume, trade_id);
        let mut state = cursor.lock();
        state.evict(now, self.ttl);

        if state.recent.contains_key(&fingerprint) {
            debug!(%fingerprint, "cursor rejected recently emitted fingerprint");
            return false;
        }

        let has_trade_id = trade_id.is_some_and(|id| !id.trim().is_empty());
        if !has_trade_id && state.last_timestamp.is_some_and(|last| timestamp < last) {
            debug!(
                exchange = %key.exchange,
                symbol = %key.symbol,
                %timestamp,
                "cursor rejected tick older than watermark"
            );
            return false;
        }

        true
    }

    /// Record a successful write: advance the watermark (never backwards) and cache the
    /// fingerprint.
    pub fn mark_emitted(
        &self,
        exchange: &str,
        symbol: &str,
        timestamp: DateTime<Utc>,
        trade_id: Option<&str>,
        price: Decimal,
        volume: Decimal,
    ) {
        self.mark_emitted_at(exchange, symbol, timestamp, trade_id, price, volume, Utc::now())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mark_emitted_at(
        &self,
        exchange: &str,
        symbol: &str,
        timestamp: DateTime<Utc>,
        trade_id: Option<&str>,
        price: Decimal,
        volume: Decimal,
        now: DateTime<Utc>,
    ) {
        let key = CursorKey::new(exchange, symbol);
        let fingerprint = fingerprint(exchange, symbol, timestamp, price, volume, trade_id);

        let cursor = self.cursor(key);
        let mut state = cursor.lock();
        state.evict(now, self.ttl);
        state.advance(timestamp);
        state.insert(fingerprint, now);
    }

    pub fn should_emit_tick(&self, tick: &Tick) -> bool {
        self.should_emit(
            &tick.source,
            &tick.symbol,
            tick.timestamp,
            tick.trade_id.as_deref(),
            tick.price,
            tick.volume,
        )
    }

    pub fn mark_tick(&self, tick: &Tick) {
        self.mark_emitted(
            &tick.source,
            &tick.symbol,
            tick.timestamp,
            tick.trade_id.as_deref(),
            tick.price,
            tick.volume,
        )
    }

    /// Seed a cursor from persisted data after a restart.
    pub fn warm<I>(
        &self,
        exchange: &str,
        symbol: &str,
        fingerprints: I,
        last_timestamp: Option<DateTime<Utc>>,
    ) where
        I: IntoIterator<Item = String>,
    {
        let now = Utc::now();
        let cursor = self.cursor(CursorKey::new(exchange, symbol));
        let mut state = cursor.lock();

        if let Some(last_timestamp) = last_timestamp {
            state.advance(last_timestamp);
        }
        for fingerprint in fingerprints {
            state.insert(fingerprint, now);
        }
    }

    pub fn last_timestamp(&self, exchange: &str, symbol: &str) -> Option<DateTime<Utc>> {
        self.existing(&CursorKey::new(exchange, symbol))
            .and_then(|cursor| cursor.lock().last_timestamp)
    }

    /// Number of (exchange, symbol) keys tracked.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing(&self, key: &CursorKey) -> Option<Arc<Mutex<CursorState>>> {
        self.shards[key.shard()].read().get(key).cloned()
    }

    fn cursor(&self, key: CursorKey) -> Arc<Mutex<CursorState>> {
        if let Some(cursor) = self.existing(&key) {
            return cursor;
        }

        let shard = key.shard();
        Arc::clone(self.shards[shard].write().entry(key).or_default())
    }
}
