// =============================================================================
// WindowMaintainer — keeps every symbol's stored history matched to its window
// =============================================================================
//
// Three duties:
//   * startup preparation: classify each symbol's coverage and load whatever
//     is missing before the stream goes live
//   * periodic reconciliation: recompute the window, trim rows that fell out
//     of it, and backfill gaps above the threshold
//   * coarse cleanup: purge expired candles and stale alert rows
//
// Every write path funnels through the Backfiller, so replays stay idempotent.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::ingest::Backfiller;
use crate::storage::CandleStore;
use crate::types::{
    classify_coverage, now_ms, CoverageThresholds, DataCoverage, RetentionWindow, MINUTE_MS,
};

/// Alert rows older than this are dropped by the cleanup pass.
const ALERT_RETENTION_HOURS: i64 = 24;

pub struct WindowMaintainer {
    store: Arc<dyn CandleStore>,
    backfiller: Arc<Backfiller>,
    window_hours: u32,
    gap_backfill_threshold: u64,
    load_cooldown: Duration,
    thresholds: CoverageThresholds,
    // Tracks the last full-window load per symbol so a flapping symbol
    // cannot hammer the REST API.
    last_full_load: Mutex<HashMap<String, Instant>>,
}

impl WindowMaintainer {
    pub fn new(
        store: Arc<dyn CandleStore>,
        backfiller: Arc<Backfiller>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            store,
            backfiller,
            window_hours: config.window_hours(),
            gap_backfill_threshold: config.gap_backfill_threshold,
            load_cooldown: Duration::from_secs(config.data_load_cooldown_secs),
            thresholds: config.coverage.clone(),
            last_full_load: Mutex::new(HashMap::new()),
        }
    }

    /// The current retention window shared by every symbol.
    pub fn current_window(&self) -> RetentionWindow {
        RetentionWindow::compute(now_ms(), self.window_hours)
    }

    // -----------------------------------------------------------------------
    // Startup preparation
    // -----------------------------------------------------------------------

    /// Classify and repair one symbol's history. Returns the classification
    /// that was acted on.
    pub async fn prepare_symbol(&self, symbol: &str) -> Result<DataCoverage> {
        let window = self.current_window();
        let report = self
            .store
            .check_integrity(symbol, window.start_ms, window.end_ms)
            .await?;

        let latest = self
            .store
            .latest_candle_start(symbol, window.start_ms, window.end_ms)
            .await?;
        let age_secs = latest.map(|start| {
            let closed_at = start + MINUTE_MS;
            ((now_ms() - closed_at).max(0) / 1000) as u64
        });

        let coverage = classify_coverage(&report, age_secs, &self.thresholds);
        info!(
            symbol,
            coverage = %coverage,
            existing = report.existing_count,
            expected = report.expected_count,
            integrity_pct = format!("{:.1}", report.integrity_pct).as_str(),
            age_secs,
            "startup coverage"
        );

        match coverage {
            DataCoverage::Sufficient => {}
            DataCoverage::Partial => {
                // Scattered gaps: re-request the whole window, existing keys
                // are skipped.
                self.backfiller
                    .backfill(symbol, window.start_ms, window.end_ms)
                    .await;
            }
            DataCoverage::Outdated => {
                // History is dense but stops short of now; fetch the tail.
                if let Some(start) = latest {
                    self.backfiller
                        .backfill(symbol, start + MINUTE_MS, window.end_ms)
                        .await;
                }
            }
            DataCoverage::NeedsFullLoad => {
                if self.full_load_allowed(symbol) {
                    self.backfiller
                        .backfill(symbol, window.start_ms, window.end_ms)
                        .await;
                } else {
                    debug!(symbol, "full load suppressed by cooldown");
                }
            }
        }

        Ok(coverage)
    }

    /// Prepare every symbol in the set. Errors on individual symbols are
    /// logged, never fatal.
    pub async fn prepare_all(&self, symbols: &HashSet<String>) {
        for symbol in symbols {
            if let Err(e) = self.prepare_symbol(symbol).await {
                warn!(symbol, error = %e, "startup preparation failed");
            }
        }
    }

    fn full_load_allowed(&self, symbol: &str) -> bool {
        let mut loads = self.last_full_load.lock();
        match loads.get(symbol) {
            Some(at) if at.elapsed() < self.load_cooldown => false,
            _ => {
                loads.insert(symbol.to_string(), Instant::now());
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Periodic reconciliation
    // -----------------------------------------------------------------------

    /// One reconcile pass for one symbol: trim rows outside the window, then
    /// backfill if the gap count crosses the threshold.
    pub async fn reconcile_symbol(&self, symbol: &str) -> Result<()> {
        let window = self.current_window();

        let trimmed = self.store.delete_before(symbol, window.start_ms).await?;
        if trimmed > 0 {
            debug!(symbol, trimmed, window = %window, "trimmed expired candles");
        }

        // Rows at or past the window end can only come from clock skew or a
        // bad historical write; they would poison the integrity count.
        let future = self.store.delete_at_or_after(symbol, window.end_ms).await?;
        if future > 0 {
            warn!(symbol, future, window = %window, "removed future-dated candles");
        }

        let report = self
            .store
            .check_integrity(symbol, window.start_ms, window.end_ms)
            .await?;

        if report.missing_count < self.gap_backfill_threshold {
            return Ok(());
        }

        info!(
            symbol,
            missing = report.missing_count,
            existing = report.existing_count,
            "gap above threshold — backfilling window"
        );
        self.backfiller
            .backfill(symbol, window.start_ms, window.end_ms)
            .await;

        let after = self
            .store
            .check_integrity(symbol, window.start_ms, window.end_ms)
            .await?;
        if after.missing_count >= self.gap_backfill_threshold {
            warn!(
                symbol,
                missing = after.missing_count,
                "gaps persist after backfill — exchange has no data for them"
            );
        }

        Ok(())
    }

    /// Reconcile every symbol in the set.
    pub async fn reconcile_all(&self, symbols: &HashSet<String>) {
        let started = Instant::now();
        for symbol in symbols {
            if let Err(e) = self.reconcile_symbol(symbol).await {
                warn!(symbol, error = %e, "window reconciliation failed");
            }
        }
        debug!(
            symbols = symbols.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "window reconciliation pass complete"
        );
    }

    // -----------------------------------------------------------------------
    // Coarse cleanup
    // -----------------------------------------------------------------------

    /// Purge candles older than the window across all symbols, plus stale
    /// alert rows.
    pub async fn cleanup_pass(&self) -> Result<()> {
        let now = now_ms();
        let candle_cutoff = now - (self.window_hours as i64) * 60 * MINUTE_MS;
        let alert_cutoff = now - ALERT_RETENTION_HOURS * 60 * MINUTE_MS;

        let candles = self.store.cleanup_expired(candle_cutoff).await?;
        let alerts = self.store.cleanup_stale_alerts(alert_cutoff).await?;

        if candles > 0 || alerts > 0 {
            info!(candles, alerts, "cleanup pass removed expired rows");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bybit::KlineSource;
    use crate::storage::MemoryCandleStore;
    use crate::types::{minute_floor, Candle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves any requested minute range (or nothing, when `empty` is set).
    struct InfiniteSource {
        fetch_calls: AtomicUsize,
        empty: bool,
    }

    impl InfiniteSource {
        fn new() -> Self {
            Self {
                fetch_calls: AtomicUsize::new(0),
                empty: false,
            }
        }

        fn barren() -> Self {
            Self {
                fetch_calls: AtomicUsize::new(0),
                empty: true,
            }
        }

        fn calls(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KlineSource for InfiniteSource {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            start_ms: i64,
            end_ms: i64,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.empty {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            let mut ts = minute_floor(start_ms);
            if ts < start_ms {
                ts += MINUTE_MS;
            }
            while ts < end_ms && out.len() < limit {
                out.push(test_candle(ts));
                ts += MINUTE_MS;
            }
            out.reverse();
            Ok(out)
        }
    }

    fn test_candle(start_ms: i64) -> Candle {
        Candle {
            start_ms,
            end_ms: start_ms + MINUTE_MS,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            closed: true,
        }
    }

    fn maintainer(
        source: Arc<InfiniteSource>,
        store: Arc<MemoryCandleStore>,
    ) -> WindowMaintainer {
        let config = IngestConfig::default();
        let backfiller = Arc::new(Backfiller::new(source, store.clone(), 1000, 0));
        WindowMaintainer::new(store, backfiller, &config)
    }

    async fn seed_range(store: &MemoryCandleStore, symbol: &str, start_ms: i64, end_ms: i64) {
        let mut ts = start_ms;
        while ts < end_ms {
            store
                .save_candle(symbol, &test_candle(ts), true)
                .await
                .unwrap();
            ts += MINUTE_MS;
        }
    }

    #[tokio::test]
    async fn empty_symbol_gets_full_load() {
        let source = Arc::new(InfiniteSource::new());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source, store.clone());

        let coverage = wm.prepare_symbol("BTCUSDT").await.unwrap();
        assert_eq!(coverage, DataCoverage::NeedsFullLoad);
        // Default window is 4 h -> 240 one-minute candles.
        assert_eq!(store.closed_count("BTCUSDT"), 240);
    }

    #[tokio::test]
    async fn nearly_complete_symbol_needs_no_fetch() {
        let source = Arc::new(InfiniteSource::new());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source.clone(), store.clone());

        // Window fully seeded except 4 scattered minutes; recent tail present
        // so the data reads as fresh.
        let w = wm.current_window();
        seed_range(&store, "ETHUSDT", w.start_ms, w.end_ms).await;
        for i in [10, 40, 80, 120] {
            store
                .delete_at_or_after("ETHUSDT", w.start_ms + i * MINUTE_MS)
                .await
                .unwrap();
            seed_range(
                &store,
                "ETHUSDT",
                w.start_ms + (i + 1) * MINUTE_MS,
                w.end_ms,
            )
            .await;
        }

        let coverage = wm.prepare_symbol("ETHUSDT").await.unwrap();
        assert_eq!(coverage, DataCoverage::Sufficient);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn dense_but_old_history_refreshes_the_tail() {
        let source = Arc::new(InfiniteSource::new());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source.clone(), store.clone());

        // Only the oldest hour of the window is populated; the newest candle
        // is ~3 h old, past the 2 h freshness cutoff.
        let w = wm.current_window();
        seed_range(&store, "BTCUSDT", w.start_ms, w.start_ms + 60 * MINUTE_MS).await;

        let coverage = wm.prepare_symbol("BTCUSDT").await.unwrap();
        assert_eq!(coverage, DataCoverage::Outdated);
        assert!(source.calls() >= 1);
        // Tail refresh fills the rest of the window.
        assert!(store.closed_count("BTCUSDT") >= 239);
    }

    #[tokio::test]
    async fn full_load_respects_cooldown() {
        // Exchange has no data, so the symbol stays in the full-load state.
        let source = Arc::new(InfiniteSource::barren());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source.clone(), store);

        wm.prepare_symbol("BTCUSDT").await.unwrap();
        assert_eq!(source.calls(), 1);

        // Immediately again: classification is unchanged, but no request.
        wm.prepare_symbol("BTCUSDT").await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn reconcile_trims_rows_outside_window() {
        let source = Arc::new(InfiniteSource::barren());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source, store.clone());

        let w = wm.current_window();
        // Rows well before the window, a full current window, and a few
        // future-dated rows past the end.
        seed_range(
            &store,
            "BTCUSDT",
            w.start_ms - 30 * MINUTE_MS,
            w.start_ms,
        )
        .await;
        seed_range(&store, "BTCUSDT", w.start_ms, w.end_ms).await;
        seed_range(
            &store,
            "BTCUSDT",
            w.end_ms + 5 * MINUTE_MS,
            w.end_ms + 10 * MINUTE_MS,
        )
        .await;

        wm.reconcile_symbol("BTCUSDT").await.unwrap();

        // Everything left sits inside the window (the boundary may have
        // advanced a minute since `w` was computed).
        let after = wm.current_window();
        let starts = store.closed_starts("BTCUSDT");
        assert!(starts.iter().all(|&s| s >= w.start_ms && s < after.end_ms));
        assert!(starts.len() >= 239 && starts.len() <= 240);
    }

    #[tokio::test]
    async fn small_gap_does_not_trigger_backfill() {
        let source = Arc::new(InfiniteSource::new());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source.clone(), store.clone());

        // 3 missing < threshold of 5. Seed slightly beyond the window end so
        // a minute-boundary advance cannot add a fourth gap.
        let w = wm.current_window();
        seed_range(&store, "BTCUSDT", w.start_ms, w.end_ms + 2 * MINUTE_MS).await;
        for i in [5, 50, 100] {
            let ts = w.start_ms + i * MINUTE_MS;
            store.delete_at_or_after("BTCUSDT", ts).await.unwrap();
            seed_range(&store, "BTCUSDT", ts + MINUTE_MS, w.end_ms + 2 * MINUTE_MS).await;
        }

        wm.reconcile_symbol("BTCUSDT").await.unwrap();
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn large_gap_triggers_backfill() {
        let source = Arc::new(InfiniteSource::new());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source.clone(), store.clone());

        // Only half the window present -> missing far above threshold.
        let w = wm.current_window();
        seed_range(&store, "BTCUSDT", w.start_ms, w.start_ms + 120 * MINUTE_MS).await;

        wm.reconcile_symbol("BTCUSDT").await.unwrap();
        assert!(source.calls() >= 1);
        assert!(store.closed_count("BTCUSDT") >= 239);
    }

    #[tokio::test]
    async fn cleanup_purges_candles_and_alerts() {
        let source = Arc::new(InfiniteSource::barren());
        let store = Arc::new(MemoryCandleStore::new());
        let wm = maintainer(source, store.clone());

        let now = now_ms();
        // One candle a day old, one inside the window.
        store
            .save_candle("BTCUSDT", &test_candle(minute_floor(now) - 24 * 60 * MINUTE_MS), true)
            .await
            .unwrap();
        store
            .save_candle("BTCUSDT", &test_candle(minute_floor(now) - MINUTE_MS), true)
            .await
            .unwrap();

        store.record_alert("BTCUSDT", now - 48 * 3_600_000, "old".into());
        store.record_alert("BTCUSDT", now - 3_600_000, "recent".into());

        wm.cleanup_pass().await.unwrap();

        assert_eq!(store.closed_count("BTCUSDT"), 1);
        // Only the recent alert survived the pass.
        assert_eq!(store.cleanup_stale_alerts(i64::MAX).await.unwrap(), 1);
    }
}
