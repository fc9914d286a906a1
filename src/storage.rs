// =============================================================================
// Storage collaborator — candle persistence seen through a narrow trait
// =============================================================================
//
// The engine never talks to a database directly; everything goes through
// [`CandleStore`]. The in-memory implementation below is the default wiring
// and the test double. A persistent backend plugs in behind the same trait.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{Candle, DataIntegrityReport, MINUTE_MS};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Persistence surface consumed by the ingestion engine.
///
/// All candle operations are keyed by `(symbol, start_ms)`. Saving a candle
/// with an existing key overwrites it (idempotent upsert), which is what lets
/// the engine tolerate replays across session boundaries.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Current watchlist — the set of symbols the engine must track.
    async fn desired_symbols(&self) -> Result<HashSet<String>>;

    /// True if a closed candle with this key is already stored.
    async fn candle_exists(&self, symbol: &str, start_ms: i64) -> Result<bool>;

    /// Upsert a candle. `closed == false` updates the symbol's live row
    /// instead of the permanent series.
    async fn save_candle(&self, symbol: &str, candle: &Candle, closed: bool) -> Result<()>;

    /// Expected-vs-actual closed-candle comparison over `[start_ms, end_ms)`.
    async fn check_integrity(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<DataIntegrityReport>;

    /// Newest stored closed-candle `start_ms` within `[start_ms, end_ms)`.
    async fn latest_candle_start(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Option<i64>>;

    /// Delete closed candles with `start_ms < time_ms`. Returns rows removed.
    async fn delete_before(&self, symbol: &str, time_ms: i64) -> Result<u64>;

    /// Delete closed candles with `start_ms >= time_ms`. Returns rows removed.
    async fn delete_at_or_after(&self, symbol: &str, time_ms: i64) -> Result<u64>;

    /// Coarse purge across all symbols: drop candles older than the cutoff.
    async fn cleanup_expired(&self, older_than_ms: i64) -> Result<u64>;

    /// Drop alert rows older than the cutoff.
    async fn cleanup_stale_alerts(&self, older_than_ms: i64) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// A stored alert row; only the timestamp matters for retention.
#[derive(Debug, Clone)]
pub struct AlertRow {
    pub symbol: String,
    pub created_ms: i64,
    pub message: String,
}

/// In-memory [`CandleStore`] backed by one `BTreeMap` per symbol.
///
/// Closed candles live in the ordered map (keyed by `start_ms`); the live
/// in-progress candle is kept separately and overwritten on every tick.
#[derive(Default)]
pub struct MemoryCandleStore {
    watchlist: RwLock<HashSet<String>>,
    closed: RwLock<HashMap<String, BTreeMap<i64, Candle>>>,
    live: RwLock<HashMap<String, Candle>>,
    alerts: RwLock<Vec<AlertRow>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the watchlist. Used at bootstrap when storage starts empty.
    pub fn add_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut wl = self.watchlist.write();
        for s in symbols {
            wl.insert(s.into());
        }
    }

    pub fn remove_symbol(&self, symbol: &str) {
        self.watchlist.write().remove(symbol);
    }

    /// Record an alert row (called by the alert collaborator wiring).
    pub fn record_alert(&self, symbol: &str, created_ms: i64, message: String) {
        self.alerts.write().push(AlertRow {
            symbol: symbol.to_string(),
            created_ms,
            message,
        });
    }

    /// Number of closed candles stored for `symbol` (test helper).
    pub fn closed_count(&self, symbol: &str) -> usize {
        self.closed
            .read()
            .get(symbol)
            .map_or(0, |series| series.len())
    }

    /// All stored closed-candle start timestamps for `symbol`, ascending.
    pub fn closed_starts(&self, symbol: &str) -> Vec<i64> {
        self.closed
            .read()
            .get(symbol)
            .map_or_else(Vec::new, |series| series.keys().copied().collect())
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn desired_symbols(&self) -> Result<HashSet<String>> {
        Ok(self.watchlist.read().clone())
    }

    async fn candle_exists(&self, symbol: &str, start_ms: i64) -> Result<bool> {
        Ok(self
            .closed
            .read()
            .get(symbol)
            .is_some_and(|series| series.contains_key(&start_ms)))
    }

    async fn save_candle(&self, symbol: &str, candle: &Candle, closed: bool) -> Result<()> {
        if closed {
            self.closed
                .write()
                .entry(symbol.to_string())
                .or_default()
                .insert(candle.start_ms, candle.clone());
        } else {
            self.live.write().insert(symbol.to_string(), candle.clone());
        }
        Ok(())
    }

    async fn check_integrity(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<DataIntegrityReport> {
        let expected = ((end_ms - start_ms) / MINUTE_MS).max(0) as u64;
        let existing = self
            .closed
            .read()
            .get(symbol)
            .map_or(0, |series| series.range(start_ms..end_ms).count()) as u64;
        Ok(DataIntegrityReport::new(expected, existing))
    }

    async fn latest_candle_start(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Option<i64>> {
        Ok(self.closed.read().get(symbol).and_then(|series| {
            series
                .range(start_ms..end_ms)
                .next_back()
                .map(|(k, _)| *k)
        }))
    }

    async fn delete_before(&self, symbol: &str, time_ms: i64) -> Result<u64> {
        let mut map = self.closed.write();
        let Some(series) = map.get_mut(symbol) else {
            return Ok(0);
        };
        let keep = series.split_off(&time_ms);
        let removed = series.len() as u64;
        *series = keep;
        Ok(removed)
    }

    async fn delete_at_or_after(&self, symbol: &str, time_ms: i64) -> Result<u64> {
        let mut map = self.closed.write();
        let Some(series) = map.get_mut(symbol) else {
            return Ok(0);
        };
        let removed = series.split_off(&time_ms);
        Ok(removed.len() as u64)
    }

    async fn cleanup_expired(&self, older_than_ms: i64) -> Result<u64> {
        let mut total = 0u64;
        let mut map = self.closed.write();
        for series in map.values_mut() {
            let keep = series.split_off(&older_than_ms);
            total += series.len() as u64;
            *series = keep;
        }
        Ok(total)
    }

    async fn cleanup_stale_alerts(&self, older_than_ms: i64) -> Result<u64> {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.created_ms >= older_than_ms);
        Ok((before - alerts.len()) as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(start_ms: i64) -> Candle {
        Candle {
            start_ms,
            end_ms: start_ms + MINUTE_MS,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            closed: true,
        }
    }

    #[tokio::test]
    async fn save_and_exists() {
        let store = MemoryCandleStore::new();
        let c = candle(60_000);

        assert!(!store.candle_exists("BTCUSDT", 60_000).await.unwrap());
        store.save_candle("BTCUSDT", &c, true).await.unwrap();
        assert!(store.candle_exists("BTCUSDT", 60_000).await.unwrap());

        // Upsert with the same key does not duplicate.
        store.save_candle("BTCUSDT", &c, true).await.unwrap();
        assert_eq!(store.closed_count("BTCUSDT"), 1);
    }

    #[tokio::test]
    async fn live_candles_do_not_touch_series() {
        let store = MemoryCandleStore::new();
        let mut c = candle(60_000);
        c.closed = false;
        store.save_candle("BTCUSDT", &c, false).await.unwrap();
        assert_eq!(store.closed_count("BTCUSDT"), 0);
        assert!(!store.candle_exists("BTCUSDT", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn integrity_over_range() {
        let store = MemoryCandleStore::new();
        // 10-minute range with 7 stored candles.
        for i in 0..7 {
            store
                .save_candle("ETHUSDT", &candle(i * MINUTE_MS), true)
                .await
                .unwrap();
        }
        let report = store
            .check_integrity("ETHUSDT", 0, 10 * MINUTE_MS)
            .await
            .unwrap();
        assert_eq!(report.expected_count, 10);
        assert_eq!(report.existing_count, 7);
        assert_eq!(report.missing_count, 3);
    }

    #[tokio::test]
    async fn delete_before_and_after() {
        let store = MemoryCandleStore::new();
        for i in 0..10 {
            store
                .save_candle("BTCUSDT", &candle(i * MINUTE_MS), true)
                .await
                .unwrap();
        }

        let removed = store.delete_before("BTCUSDT", 3 * MINUTE_MS).await.unwrap();
        assert_eq!(removed, 3);

        let removed = store
            .delete_at_or_after("BTCUSDT", 8 * MINUTE_MS)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        assert_eq!(
            store.closed_starts("BTCUSDT"),
            vec![
                3 * MINUTE_MS,
                4 * MINUTE_MS,
                5 * MINUTE_MS,
                6 * MINUTE_MS,
                7 * MINUTE_MS
            ]
        );
    }

    #[tokio::test]
    async fn latest_candle_in_range() {
        let store = MemoryCandleStore::new();
        for i in [1, 4, 6] {
            store
                .save_candle("BTCUSDT", &candle(i * MINUTE_MS), true)
                .await
                .unwrap();
        }
        let latest = store
            .latest_candle_start("BTCUSDT", 0, 5 * MINUTE_MS)
            .await
            .unwrap();
        assert_eq!(latest, Some(4 * MINUTE_MS));

        let none = store
            .latest_candle_start("XRPUSDT", 0, 5 * MINUTE_MS)
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn cleanup_expired_spans_symbols() {
        let store = MemoryCandleStore::new();
        store.save_candle("A", &candle(0), true).await.unwrap();
        store
            .save_candle("A", &candle(5 * MINUTE_MS), true)
            .await
            .unwrap();
        store.save_candle("B", &candle(MINUTE_MS), true).await.unwrap();

        let removed = store.cleanup_expired(2 * MINUTE_MS).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.closed_count("A"), 1);
        assert_eq!(store.closed_count("B"), 0);
    }

    #[tokio::test]
    async fn stale_alerts_are_purged() {
        let store = MemoryCandleStore::new();
        store.record_alert("BTCUSDT", 1_000, "old".into());
        store.record_alert("BTCUSDT", 9_000, "new".into());

        let removed = store.cleanup_stale_alerts(5_000).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn watchlist_seed_and_remove() {
        let store = MemoryCandleStore::new();
        store.add_symbols(["BTCUSDT", "ETHUSDT"]);
        assert_eq!(store.desired_symbols().await.unwrap().len(), 2);

        store.remove_symbol("ETHUSDT");
        let symbols = store.desired_symbols().await.unwrap();
        assert!(symbols.contains("BTCUSDT"));
        assert!(!symbols.contains("ETHUSDT"));
    }
}
