// =============================================================================
// ConnectionController — WebSocket session lifecycle with bounded backoff
// =============================================================================
//
// One session at a time. The run loop connects, binds the session to the
// subscription manager, reconciles topics, then services inbound frames until
// the session dies (socket error, server close, forced reconnect, shutdown).
// Reconnects wait min(base * attempt, max); a session that stayed up past the
// stability threshold resets the attempt counter. After the attempt budget is
// exhausted the controller stops permanently and flags itself unhealthy.
//
// Outbound frames (subscribes, pings) travel over an unbounded channel to a
// dedicated writer task, so no component ever holds the sink across an await.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::{watch, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertSink;
use crate::bybit::ws::{self, InboundMessage};
use crate::config::IngestConfig;
use crate::events::{now_rfc3339, ConnectionStatus, EventBus, IngestEvent};
use crate::ingest::{PairRegistry, StreamHealthMonitor, SubscriptionManager};
use crate::storage::CandleStore;
use crate::types::{now_ms, Candle};

/// How often cumulative stream statistics are logged.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound on the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a session ended. `stable` is true when the session was connected
/// long enough to reset the reconnect attempt counter.
enum SessionEnd {
    Shutdown,
    Disconnected { reason: String, stable: bool },
}

#[derive(Default)]
struct StreamStats {
    ticks: AtomicU64,
    closed_saved: AtomicU64,
    duplicates: AtomicU64,
    dropped_unknown: AtomicU64,
}

pub struct ConnectionController {
    ws_url: String,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    stable_after: Duration,
    ping_interval: Duration,

    registry: Arc<PairRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    health: Arc<StreamHealthMonitor>,
    store: Arc<dyn CandleStore>,
    alerts: Arc<dyn AlertSink>,
    events: EventBus,

    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    fatal: AtomicBool,
    /// Epoch ms of the last inbound frame; 0 while disconnected.
    last_inbound_ms: AtomicI64,
    force_notify: Notify,
    /// Last closed-candle start saved per symbol, to suppress replays of the
    /// same finalized minute within a session.
    last_closed: RwLock<std::collections::HashMap<String, i64>>,
    stats: StreamStats,
}

impl ConnectionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &IngestConfig,
        registry: Arc<PairRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        health: Arc<StreamHealthMonitor>,
        store: Arc<dyn CandleStore>,
        alerts: Arc<dyn AlertSink>,
        events: EventBus,
    ) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        Self {
            ws_url: config.ws_url.clone(),
            base_delay: Duration::from_secs(config.reconnect_base_delay_secs),
            max_delay: Duration::from_secs(config.reconnect_max_delay_secs),
            max_attempts: config.max_reconnect_attempts,
            stable_after: Duration::from_secs(config.connection_stable_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            registry,
            subscriptions,
            health,
            store,
            alerts,
            events,
            connected_tx,
            connected_rx,
            fatal: AtomicBool::new(false),
            last_inbound_ms: AtomicI64::new(0),
            force_notify: Notify::new(),
            last_closed: RwLock::new(std::collections::HashMap::new()),
            stats: StreamStats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // State queries
    // -----------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// False once the reconnect budget is exhausted.
    pub fn is_healthy(&self) -> bool {
        !self.fatal.load(Ordering::SeqCst)
    }

    /// Seconds since the last inbound frame, `None` while disconnected.
    pub fn last_inbound_age_secs(&self) -> Option<u64> {
        if !self.is_connected() {
            return None;
        }
        let at = self.last_inbound_ms.load(Ordering::SeqCst);
        if at == 0 {
            return None;
        }
        Some(((now_ms() - at).max(0) / 1000) as u64)
    }

    /// Block until the controller reports connected, or the timeout expires.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected_rx.clone();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    /// Tear down the active session. The run loop treats this as a normal
    /// session end and reconnects with backoff.
    pub fn force_reconnect(&self, reason: &str) {
        warn!(%reason, "forcing reconnect");
        self.force_notify.notify_one();
    }

    fn touch_inbound(&self) {
        self.last_inbound_ms.store(now_ms(), Ordering::SeqCst);
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        (self.base_delay * attempt).min(self.max_delay)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let end = self.run_session(&mut shutdown).await;

            self.last_inbound_ms.store(0, Ordering::SeqCst);
            self.subscriptions.clear_session();
            let _ = self.connected_tx.send(false);

            let (reason, stable) = match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected { reason, stable }) => (reason, stable),
                Err(e) => (format!("connect failed: {e:#}"), false),
            };

            self.events.publish(IngestEvent::ConnectionStatus {
                status: ConnectionStatus::Disconnected,
                pairs_count: self.registry.len(),
                subscribed_count: 0,
                pending_count: 0,
                reason: Some(reason.clone()),
                timestamp: now_rfc3339(),
            });

            if stable {
                attempts = 0;
            }
            attempts += 1;

            if attempts > self.max_attempts {
                error!(
                    attempts = self.max_attempts,
                    "reconnect attempts exhausted — stopping permanently"
                );
                self.fatal.store(true, Ordering::SeqCst);
                break;
            }

            let delay = self.reconnect_delay(attempts);
            info!(
                attempt = attempts,
                of = self.max_attempts,
                delay_secs = delay.as_secs(),
                %reason,
                "session ended — reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("connection controller stopped");
    }

    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let session_id = Uuid::new_v4();
        info!(%session_id, url = %self.ws_url, "connecting");

        // The handshake is bounded and raced against shutdown so a stalled
        // endpoint can neither hang teardown nor eat the attempt budget.
        let handshake = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.ws_url.as_str()));
        let (stream, _) = tokio::select! {
            res = handshake => match res {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => return Err(e).context("websocket handshake failed"),
                Err(_) => anyhow::bail!(
                    "websocket handshake timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ),
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(SessionEnd::Shutdown);
                }
                anyhow::bail!("shutdown channel closed during handshake");
            }
        };
        let connected_at = Instant::now();
        let (mut sink, mut read) = stream.split();

        // A force request issued while disconnected targeted a session that
        // no longer exists; drop the stored permit so it cannot tear down
        // this one.
        let _ = self.force_notify.notified().now_or_never();

        // All outbound frames funnel through this channel into one writer.
        let (tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = cmd_rx.recv().await {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.subscriptions.bind_session(tx.clone());
        self.health.reset_session();
        self.last_closed.write().clear();
        self.touch_inbound();
        let _ = self.connected_tx.send(true);

        info!(%session_id, "connected");
        self.publish_connected();

        // Subscriptions do not survive reconnects; re-issue everything.
        self.subscriptions.reconcile(&self.registry.snapshot()).await;

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // immediate first tick

        let mut stats_log = tokio::time::interval(STATS_LOG_INTERVAL);
        stats_log.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stats_log.tick().await;

        // `None` means shutdown; `Some(reason)` is a normal session end.
        let ended = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break None;
                    }
                }
                _ = self.force_notify.notified() => {
                    break Some("reconnect requested".to_string());
                }
                _ = ping.tick() => {
                    if tx.send(ws::ping_frame()).is_err() {
                        break Some("writer task gone".to_string());
                    }
                }
                _ = stats_log.tick() => self.log_stats(),
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.touch_inbound();
                        self.handle_text(&text).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Some(format!("server closed connection: {frame:?}"));
                    }
                    Some(Ok(_)) => self.touch_inbound(),
                    Some(Err(e)) => {
                        break Some(format!("read error: {e}"));
                    }
                    None => {
                        break Some("stream ended".to_string());
                    }
                },
            }
        };

        drop(tx);
        writer.abort();
        info!(%session_id, "session closed");

        Ok(match ended {
            None => SessionEnd::Shutdown,
            Some(reason) => SessionEnd::Disconnected {
                reason,
                stable: connected_at.elapsed() >= self.stable_after,
            },
        })
    }

    fn publish_connected(&self) {
        let counts = self.subscriptions.counts();
        self.events.publish(IngestEvent::ConnectionStatus {
            status: ConnectionStatus::Connected,
            pairs_count: self.registry.len(),
            subscribed_count: counts.subscribed,
            pending_count: counts.pending,
            reason: None,
            timestamp: now_rfc3339(),
        });
    }

    fn log_stats(&self) {
        info!(
            ticks = self.stats.ticks.load(Ordering::Relaxed),
            closed_saved = self.stats.closed_saved.load(Ordering::Relaxed),
            duplicates = self.stats.duplicates.load(Ordering::Relaxed),
            dropped_unknown = self.stats.dropped_unknown.load(Ordering::Relaxed),
            "stream statistics"
        );
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    async fn handle_text(&self, text: &str) {
        match ws::parse_inbound(text) {
            Ok(InboundMessage::Kline { symbol, candle }) => {
                self.handle_kline(&symbol, candle).await;
            }
            Ok(InboundMessage::Ack { success, ret_msg }) => {
                if success {
                    debug!("subscription ack received");
                } else {
                    // The ack does not name the failing topics; ticks (or
                    // their absence) settle each symbol's fate.
                    warn!(%ret_msg, "subscription batch rejected by exchange");
                }
            }
            Ok(InboundMessage::Pong) => debug!("pong received"),
            Ok(InboundMessage::Ignored) => {}
            Err(e) => warn!(error = %e, "unparseable inbound frame dropped"),
        }
    }

    async fn handle_kline(&self, symbol: &str, candle: Candle) {
        // Late frames for symbols already removed from the watchlist.
        if !self.registry.contains(symbol) {
            self.stats.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            debug!(symbol, "tick for undesired symbol dropped");
            return;
        }

        if self.subscriptions.on_tick_observed(symbol) {
            debug!(symbol, "subscription confirmed by first tick");
        }
        self.health.record_tick(symbol);
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        if candle.closed {
            // The exchange may resend a finalized minute; save once.
            let duplicate = {
                let mut last = self.last_closed.write();
                match last.get(symbol) {
                    Some(&at) if at == candle.start_ms => true,
                    _ => {
                        last.insert(symbol.to_string(), candle.start_ms);
                        false
                    }
                }
            };
            if duplicate {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return;
            }

            if let Err(e) = self.store.save_candle(symbol, &candle, true).await {
                warn!(symbol, error = %e, "failed to save closed candle");
                return;
            }
            self.stats.closed_saved.fetch_add(1, Ordering::Relaxed);
            self.alerts.on_closed_candle(symbol, &candle).await;
        } else if let Err(e) = self.store.save_candle(symbol, &candle, false).await {
            warn!(symbol, error = %e, "failed to save live candle");
            return;
        }

        self.events.publish(IngestEvent::KlineUpdate {
            symbol: symbol.to_string(),
            data: candle.clone(),
            is_closed: candle.closed,
            server_timestamp: candle.start_ms,
            timestamp: now_rfc3339(),
        });
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

    fn controller(store: Arc<MemoryCandleStore>) -> Arc<ConnectionController> {
        controller_with(IngestConfig::default(), store)
    }

    fn controller_with(
        config: IngestConfig,
        store: Arc<MemoryCandleStore>,
    ) -> Arc<ConnectionController> {
        let events = EventBus::new(64);
        let registry = Arc::new(PairRegistry::new(store.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(50, 0, events.clone()));
        let health = Arc::new(StreamHealthMonitor::new(&config, events.clone()));
        Arc::new(ConnectionController::new(
            &config,
            registry,
            subscriptions,
            health,
            store,
            Arc::new(LogAlertSink),
            events,
        ))
    }

    fn kline_frame(symbol: &str, start_ms: i64, confirm: bool) -> String {
        format!(
            r#"{{"topic":"kline.1.{symbol}","data":[{{"start":{start_ms},"end":{},"open":"100","high":"110","low":"90","close":"105","volume":"2.5","confirm":{confirm}}}]}}"#,
            start_ms + 60_000
        )
    }

    #[tokio::test]
    async fn reconnect_delay_is_linear_and_capped() {
        let store = Arc::new(MemoryCandleStore::new());
        let c = controller(store);

        assert_eq!(c.reconnect_delay(1), Duration::from_secs(5));
        assert_eq!(c.reconnect_delay(3), Duration::from_secs(15));
        assert_eq!(c.reconnect_delay(12), Duration::from_secs(60));
        assert_eq!(c.reconnect_delay(100), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn closed_tick_is_stored_and_promotes_subscription() {
        let store = Arc::new(MemoryCandleStore::new());
        store.add_symbols(["BTCUSDT"]);
        let c = controller(store.clone());
        c.registry.load().await.unwrap();

        c.handle_text(&kline_frame("BTCUSDT", 1_700_000_040_000, true))
            .await;

        assert_eq!(store.closed_count("BTCUSDT"), 1);
        assert!(c.subscriptions.is_subscribed("BTCUSDT"));
    }

    #[tokio::test]
    async fn duplicate_closed_tick_saved_once() {
        let store = Arc::new(MemoryCandleStore::new());
        store.add_symbols(["BTCUSDT"]);
        let c = controller(store.clone());
        c.registry.load().await.unwrap();

        let frame = kline_frame("BTCUSDT", 1_700_000_040_000, true);
        c.handle_text(&frame).await;
        c.handle_text(&frame).await;

        assert_eq!(store.closed_count("BTCUSDT"), 1);
        assert_eq!(c.stats.duplicates.load(Ordering::Relaxed), 1);
        assert_eq!(c.stats.closed_saved.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn live_tick_does_not_touch_series() {
        let store = Arc::new(MemoryCandleStore::new());
        store.add_symbols(["BTCUSDT"]);
        let c = controller(store.clone());
        c.registry.load().await.unwrap();

        c.handle_text(&kline_frame("BTCUSDT", 1_700_000_040_000, false))
            .await;

        assert_eq!(store.closed_count("BTCUSDT"), 0);
        assert_eq!(c.stats.ticks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn undesired_symbol_is_dropped() {
        let store = Arc::new(MemoryCandleStore::new());
        store.add_symbols(["BTCUSDT"]);
        let c = controller(store.clone());
        c.registry.load().await.unwrap();

        c.handle_text(&kline_frame("XRPUSDT", 1_700_000_040_000, true))
            .await;

        assert_eq!(store.closed_count("XRPUSDT"), 0);
        assert_eq!(c.stats.dropped_unknown.load(Ordering::Relaxed), 1);
        assert!(!c.subscriptions.is_subscribed("XRPUSDT"));
    }

    #[tokio::test]
    async fn kline_updates_are_broadcast() {
        let store = Arc::new(MemoryCandleStore::new());
        store.add_symbols(["BTCUSDT"]);
        let c = controller(store);
        c.registry.load().await.unwrap();
        let mut rx = c.events.subscribe();

        c.handle_text(&kline_frame("BTCUSDT", 1_700_000_040_000, true))
            .await;

        match rx.recv().await.unwrap() {
            IngestEvent::KlineUpdate { symbol, is_closed, .. } => {
                assert_eq!(symbol, "BTCUSDT");
                assert!(is_closed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_do_not_panic() {
        let store = Arc::new(MemoryCandleStore::new());
        let c = controller(store);

        c.handle_text("{not json").await;
        c.handle_text(r#"{"topic":"kline.1.BTCUSDT","data":[]}"#).await;
        c.handle_text(r#"{"success":false,"ret_msg":"error:handler not found","op":"subscribe"}"#)
            .await;
    }

    #[tokio::test]
    async fn disconnected_controller_reports_no_inbound_age() {
        let store = Arc::new(MemoryCandleStore::new());
        let c = controller(store);
        assert!(!c.is_connected());
        assert_eq!(c.last_inbound_age_secs(), None);
        assert!(c.is_healthy());
        assert!(!c.wait_connected(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn shutdown_interrupts_stalled_handshake() {
        // A peer that accepts TCP but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let store = Arc::new(MemoryCandleStore::new());
        let mut config = IngestConfig::default();
        config.ws_url = format!("ws://{addr}");
        let c = controller_with(config, store);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(c.run(shutdown_rx));

        // Let the handshake stall, then request shutdown mid-connect.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("run loop kept blocking on a stalled handshake")
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_attempts_stop_the_loop_and_flip_unhealthy() {
        let store = Arc::new(MemoryCandleStore::new());
        let mut config = IngestConfig::default();
        // Nothing listens on the discard port; every connect fails fast.
        config.ws_url = "ws://127.0.0.1:9".to_string();
        config.reconnect_base_delay_secs = 0;
        config.reconnect_max_delay_secs = 0;
        config.max_reconnect_attempts = 2;
        let c = controller_with(config, store);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(c.clone().run(shutdown_rx));

        // The loop must terminate on its own, without a shutdown signal.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run loop kept retrying past max_reconnect_attempts")
            .unwrap();

        assert!(!c.is_healthy());
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn stale_force_request_does_not_kill_next_session() {
        // Minimal WebSocket server that completes the upgrade and then just
        // drains inbound frames.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    if let Ok(mut server) = tokio_tungstenite::accept_async(socket).await {
                        while let Some(Ok(_)) = server.next().await {}
                    }
                });
            }
        });

        let store = Arc::new(MemoryCandleStore::new());
        let mut config = IngestConfig::default();
        config.ws_url = format!("ws://{addr}");
        let c = controller_with(config, store);

        // Fired while disconnected: must not affect the session that
        // connects afterwards.
        c.force_reconnect("stale request");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(c.clone().run(shutdown_rx));

        assert!(c.wait_connected(Duration::from_secs(3)).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Still up: the stale permit was drained, not consumed by select.
        assert!(c.is_connected());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("run loop did not stop on shutdown")
            .unwrap();
    }
}
