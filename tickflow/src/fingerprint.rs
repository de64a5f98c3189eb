//! Deterministic dedup identity of a trade tick.
//!
//! The fingerprint is shared by the [`TickConditioner`](crate::conditioner::TickConditioner)
//! and the [`CursorStore`](crate::cursor::CursorStore), and may be persisted to warm cursor
//! caches after a restart, so it must never depend on process-local state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Compute the dedup fingerprint of a tick.
///
/// With a trade id the identity is `source:SYMBOL:id:<trade_id>`: two records carrying the same
/// exchange trade id are the same trade, even if a REST re-fetch reports a slightly different
/// price, volume or timestamp.
///
/// Without a trade id the identity falls back to
/// `source:SYMBOL:tsms:<unix_millis>:p:<price>:v:<volume>`, where decimals are rendered in their
/// normalised invariant form (`100.50` renders as `100.5`).
///
/// Source is lower-cased and symbol upper-cased. A blank trade id counts as absent.
pub fn fingerprint(
    source: &str,
    symbol: &str,
    timestamp: DateTime<Utc>,
    price: Decimal,
    volume: Decimal,
    trade_id: Option<&str>,
) -> String {
    let source = source.trim().to_lowercase();
    let symbol = symbol.trim().to_uppercase();

    match trade_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(trade_id) => format!("{source}:{symbol}:id:{trade_id}"),
        None => format!(
            "{source}:{symbol}:tsms:{}:p:{}:v:{}",
            timestamp.timestamp_millis(),
            price.normalize(),
            volume.normalize()
        ),
    }
}
