// =============================================================================
// Backfiller — paginated historical loads, idempotent by candle key
// =============================================================================
//
// Pages through /v5/market/kline until the requested range is covered or the
// exchange runs out of data. Rows arrive newest-first and are reversed into
// chronological order; each row is written only if its (symbol, start_ms)
// key is absent, so replays are free.
//
// Per-symbol backfills are serialized through an in-flight guard; unrelated
// symbols proceed in parallel.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::bybit::KlineSource;
use crate::storage::CandleStore;
use crate::types::{minute_floor, Candle, MINUTE_MS};

pub struct Backfiller {
    source: Arc<dyn KlineSource>,
    store: Arc<dyn CandleStore>,
    page_limit: usize,
    page_delay: Duration,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes the symbol from the in-flight set even on early return.
struct InFlightGuard<'a> {
    backfiller: &'a Backfiller,
    symbol: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.backfiller.in_flight.lock().remove(&self.symbol);
    }
}

impl Backfiller {
    pub fn new(
        source: Arc<dyn KlineSource>,
        store: Arc<dyn CandleStore>,
        page_limit: usize,
        page_delay_ms: u64,
    ) -> Self {
        Self {
            source,
            store,
            page_limit: page_limit.clamp(1, 1000),
            page_delay: Duration::from_millis(page_delay_ms),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Fill `[start_ms, end_ms)` for `symbol` from the exchange.
    ///
    /// Returns `false` only on a request/API failure; `true` otherwise, even
    /// when zero rows were written. A backfill already running for the same
    /// symbol short-circuits to `true` — the caller re-checks integrity on
    /// its next pass anyway.
    pub async fn backfill(&self, symbol: &str, start_ms: i64, end_ms: i64) -> bool {
        if start_ms >= end_ms {
            return true;
        }

        if !self.in_flight.lock().insert(symbol.to_string()) {
            debug!(symbol, "backfill already in flight — skipping");
            return true;
        }
        let _guard = InFlightGuard {
            backfiller: self,
            symbol: symbol.to_string(),
        };

        match self.run(symbol, start_ms, end_ms).await {
            Ok((saved, skipped)) => {
                info!(symbol, saved, skipped, start_ms, end_ms, "backfill complete");
                true
            }
            Err(e) => {
                error!(symbol, error = %e, "backfill failed");
                false
            }
        }
    }

    /// Page loop. Returns `(saved, skipped)` row counts.
    async fn run(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<(u64, u64)> {
        let mut cursor = start_ms;
        let mut saved = 0u64;
        let mut skipped = 0u64;

        while cursor < end_ms {
            let remaining_minutes = ((end_ms - cursor) / MINUTE_MS) as usize;
            // Ask for a little more than the remainder so a single page can
            // close out the range; capped at the exchange maximum.
            let limit = (remaining_minutes + 60).min(self.page_limit);

            let mut rows = self
                .source
                .fetch_klines(symbol, cursor, end_ms, limit)
                .await?;

            if rows.is_empty() {
                debug!(symbol, cursor, "empty page — no more data available");
                break;
            }

            let requested = limit;
            let received = rows.len();

            // Exchange order is newest-first; process chronologically.
            rows.reverse();

            let mut max_observed: Option<i64> = None;
            for row in &rows {
                let ts = minute_floor(row.start_ms);
                max_observed = Some(max_observed.map_or(ts, |m| m.max(ts)));

                if ts < start_ms || ts >= end_ms {
                    continue;
                }

                if self.store.candle_exists(symbol, ts).await? {
                    skipped += 1;
                    continue;
                }

                let candle = Candle {
                    start_ms: ts,
                    end_ms: ts + MINUTE_MS,
                    closed: true,
                    ..row.clone()
                };
                self.store.save_candle(symbol, &candle, true).await?;
                saved += 1;
            }

            // Resume after the newest row we saw.
            cursor = match max_observed {
                Some(ts) => ts + MINUTE_MS,
                None => break,
            };

            if received < requested {
                debug!(symbol, received, requested, "short page — end of available data");
                break;
            }

            if cursor < end_ms {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        Ok((saved, skipped))
    }
}
