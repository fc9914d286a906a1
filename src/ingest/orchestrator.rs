// =============================================================================
// IngestionOrchestrator — wiring, ordered startup, supervised loops, teardown
// =============================================================================
//
// Owns every component and the shutdown channel. Startup order matters:
// watchlist first (fatal if unreadable), then historical preparation, then
// the live connection and the periodic loops. Shutdown flips one watch value
// and joins every named task.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::AlertSink;
use crate::bybit::{BybitRestClient, KlineSource};
use crate::config::IngestConfig;
use crate::events::EventBus;
use crate::ingest::{
    Backfiller, ConnectionController, PairRegistry, StreamHealthMonitor, SubscriptionManager,
    WindowMaintainer,
};
use crate::storage::CandleStore;

/// How long teardown waits for each task before aborting it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long startup waits for the first session before proceeding anyway.
const CONNECT_WAIT: Duration = Duration::from_secs(5);

pub struct IngestionOrchestrator {
    config: IngestConfig,
    registry: Arc<PairRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    health: Arc<StreamHealthMonitor>,
    window: Arc<WindowMaintainer>,
    controller: Arc<ConnectionController>,
    events: EventBus,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl IngestionOrchestrator {
    /// Wire every component against the given storage and alert sink.
    pub fn new(
        config: IngestConfig,
        store: Arc<dyn CandleStore>,
        alerts: Arc<dyn AlertSink>,
        events: EventBus,
    ) -> Self {
        let source: Arc<dyn KlineSource> = Arc::new(BybitRestClient::new(config.rest_url.clone()));
        Self::with_source(config, store, alerts, events, source)
    }

    /// Same wiring with an injected kline source (tests use a scripted one).
    pub fn with_source(
        config: IngestConfig,
        store: Arc<dyn CandleStore>,
        alerts: Arc<dyn AlertSink>,
        events: EventBus,
        source: Arc<dyn KlineSource>,
    ) -> Self {
        let registry = Arc::new(PairRegistry::new(store.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(
            config.subscribe_batch_size,
            config.subscribe_batch_delay_ms,
            events.clone(),
        ));
        let health = Arc::new(StreamHealthMonitor::new(&config, events.clone()));
        let backfiller = Arc::new(Backfiller::new(
            source,
            store.clone(),
            config.backfill_page_limit,
            config.backfill_page_delay_ms,
        ));
        let window = Arc::new(WindowMaintainer::new(
            store.clone(),
            backfiller,
            &config,
        ));
        let controller = Arc::new(ConnectionController::new(
            &config,
            registry.clone(),
            subscriptions.clone(),
            health.clone(),
            store,
            alerts,
            events.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            registry,
            subscriptions,
            health,
            window,
            controller,
            events,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// False once the connection controller has given up permanently.
    pub fn is_healthy(&self) -> bool {
        self.controller.is_healthy()
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Ordered startup. Returns an error only when the watchlist cannot be
    /// read; everything after that degrades instead of failing.
    pub async fn start(&self) -> Result<()> {
        let pairs = self
            .registry
            .load()
            .await
            .context("cannot start without a watchlist")?;
        info!(pairs, "starting ingestion engine");

        // Repair history before the stream goes live so live ticks land on
        // top of a complete window.
        self.window.prepare_all(&self.registry.snapshot()).await;

        self.spawn_connection();

        // Give the first session a chance to come up before the periodic
        // loops start; the controller keeps retrying either way.
        if self.controller.wait_connected(CONNECT_WAIT).await {
            info!("stream connected");
        } else {
            warn!(
                timeout_secs = CONNECT_WAIT.as_secs(),
                "stream not connected yet — continuing startup"
            );
        }

        self.spawn_health();
        self.spawn_watchlist_refresh();
        self.spawn_retry_failed();
        self.spawn_window_reconcile();
        self.spawn_cleanup();

        info!("ingestion engine started");
        Ok(())
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn register(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    fn spawn_connection(&self) {
        let controller = self.controller.clone();
        let rx = self.shutdown_rx();
        self.register("connection", tokio::spawn(controller.run(rx)));
    }

    fn spawn_health(&self) {
        let health = self.health.clone();
        let controller = self.controller.clone();
        let registry = self.registry.clone();
        let rx = self.shutdown_rx();
        self.register("health", tokio::spawn(health.run(controller, registry, rx)));
    }

    fn spawn_watchlist_refresh(&self) {
        let registry = self.registry.clone();
        let subscriptions = self.subscriptions.clone();
        let health = self.health.clone();
        let window = self.window.clone();
        let interval = Duration::from_secs(self.config.pairs_check_interval_minutes * 60);
        let mut rx = self.shutdown_rx();

        self.register(
            "watchlist-refresh",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = rx.changed() => if *rx.borrow() { return },
                    }

                    let (added, removed) = match registry.refresh().await {
                        Ok(diff) => diff,
                        Err(e) => {
                            warn!(error = %e, "watchlist refresh failed");
                            continue;
                        }
                    };
                    if added.is_empty() && removed.is_empty() {
                        continue;
                    }

                    for symbol in &removed {
                        health.forget_symbol(symbol);
                    }
                    // New symbols need history before their live ticks are
                    // worth much.
                    for symbol in &added {
                        if let Err(e) = window.prepare_symbol(symbol).await {
                            warn!(symbol, error = %e, "preparation of new symbol failed");
                        }
                    }
                    subscriptions.reconcile(&registry.snapshot()).await;
                }
            }),
        );
    }

    fn spawn_retry_failed(&self) {
        let subscriptions = self.subscriptions.clone();
        let controller = self.controller.clone();
        let interval = Duration::from_secs(self.config.retry_failed_interval_secs);
        let mut rx = self.shutdown_rx();

        self.register(
            "retry-failed",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = rx.changed() => if *rx.borrow() { return },
                    }
                    if controller.is_connected() {
                        subscriptions.retry_failed().await;
                    }
                }
            }),
        );
    }

    fn spawn_window_reconcile(&self) {
        let registry = self.registry.clone();
        let window = self.window.clone();
        let interval = Duration::from_secs(self.config.window_reconcile_interval_secs);
        let mut rx = self.shutdown_rx();

        self.register(
            "window-reconcile",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = rx.changed() => if *rx.borrow() { return },
                    }
                    window.reconcile_all(&registry.snapshot()).await;
                }
            }),
        );
    }

    fn spawn_cleanup(&self) {
        let window = self.window.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        let mut rx = self.shutdown_rx();

        self.register(
            "cleanup",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = rx.changed() => if *rx.borrow() { return },
                    }
                    if let Err(e) = window.cleanup_pass().await {
                        warn!(error = %e, "cleanup pass failed");
                    }
                }
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Signal every task to stop and wait for each one to finish.
    pub async fn shutdown(&self) {
        info!("shutting down ingestion engine");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => warn!(task = name, "task did not stop in time"),
            }
        }
        info!("ingestion engine stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertSink;
    use crate::storage::MemoryCandleStore;
    use crate::types::{Candle, MINUTE_MS};
    use async_trait::async_trait;

    /// Source that always serves the requested minutes.
    struct FullSource;

    #[async_trait]
    impl KlineSource for FullSource {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            start_ms: i64,
            end_ms: i64,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            let mut out = Vec::new();
            let mut ts = crate::types::minute_floor(start_ms);
            if ts < start_ms {
                ts += MINUTE_MS;
            }
            while ts < end_ms && out.len() < limit {
                out.push(Candle {
                    start_ms: ts,
                    end_ms: ts + MINUTE_MS,
                    open: 1.0,
                    high: 2.0,
                    low: 0.5,
                    close: 1.5,
                    volume: 3.0,
                    closed: true,
                });
                ts += MINUTE_MS;
            }
            out.reverse();
            Ok(out)
        }
    }

    fn local_config() -> IngestConfig {
        let mut config = IngestConfig::default();
        // Unroutable endpoints so no test touches the network.
        config.ws_url = "ws://127.0.0.1:9".to_string();
        config.rest_url = "http://127.0.0.1:9".to_string();
        config
    }

    #[tokio::test]
    async fn start_prepares_history_then_shutdown_joins_tasks() {
        let store = Arc::new(MemoryCandleStore::new());
        store.add_symbols(["BTCUSDT"]);

        let orch = IngestionOrchestrator::with_source(
            local_config(),
            store.clone(),
            Arc::new(LogAlertSink),
            EventBus::new(64),
            Arc::new(FullSource),
        );

        orch.start().await.unwrap();
        // Startup preparation filled the 4 h window from the source.
        assert_eq!(store.closed_count("BTCUSDT"), 240);
        assert!(orch.is_healthy());

        orch.shutdown().await;
        assert!(orch.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_watchlist_still_starts() {
        let store = Arc::new(MemoryCandleStore::new());
        let orch = IngestionOrchestrator::with_source(
            local_config(),
            store,
            Arc::new(LogAlertSink),
            EventBus::new(64),
            Arc::new(FullSource),
        );

        orch.start().await.unwrap();
        orch.shutdown().await;
    }
}
