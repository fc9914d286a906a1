// =============================================================================
// StreamHealthMonitor — per-symbol tick liveness and session staleness
// =============================================================================
//
// Dispatch stamps every kline tick here. A periodic check classifies each
// desired symbol as fresh / stale / critical by tick age, publishes a
// health snapshot, and asks the connection controller for a reconnect when
// too large a fraction of the watchlist has gone quiet. Symbols never seen
// in the current session age from the session start.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::events::{now_rfc3339, ConnectionStatus, EventBus, IngestEvent, SymbolHealthDetail};
use crate::ingest::{ConnectionController, PairRegistry};

/// Liveness classification for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLiveness {
    Fresh,
    Stale,
    Critical,
}

impl SymbolLiveness {
    fn as_str(self) -> &'static str {
        match self {
            SymbolLiveness::Fresh => "fresh",
            SymbolLiveness::Stale => "stale",
            SymbolLiveness::Critical => "critical",
        }
    }
}

/// Aggregated result of one health check.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub fresh: usize,
    pub stale: usize,
    pub critical: usize,
    pub total: usize,
    pub details: Vec<SymbolHealthDetail>,
}

pub struct StreamHealthMonitor {
    stale_after: Duration,
    critical_after: Duration,
    critical_fraction: f64,
    stale_fraction: f64,
    check_interval: Duration,
    session_warning: Duration,
    session_force: Duration,
    last_tick: RwLock<HashMap<String, Instant>>,
    /// Baseline for symbols with no tick yet in this session.
    session_started: RwLock<Instant>,
    events: EventBus,
}

impl StreamHealthMonitor {
    pub fn new(config: &IngestConfig, events: EventBus) -> Self {
        Self {
            stale_after: Duration::from_secs(config.symbol_stale_secs),
            critical_after: Duration::from_secs(config.symbol_critical_secs),
            critical_fraction: config.critical_fraction,
            stale_fraction: config.stale_fraction,
            check_interval: Duration::from_secs(config.health_check_interval_secs),
            session_warning: Duration::from_secs(config.session_warning_secs),
            session_force: Duration::from_secs(config.session_force_secs),
            last_tick: RwLock::new(HashMap::new()),
            session_started: RwLock::new(Instant::now()),
            events,
        }
    }

    #[cfg(test)]
    fn with_thresholds(stale_after: Duration, critical_after: Duration) -> Self {
        let mut m = Self::new(&IngestConfig::default(), EventBus::new(16));
        m.stale_after = stale_after;
        m.critical_after = critical_after;
        m
    }

    // -----------------------------------------------------------------------
    // Tick bookkeeping
    // -----------------------------------------------------------------------

    pub fn record_tick(&self, symbol: &str) {
        self.last_tick
            .write()
            .insert(symbol.to_string(), Instant::now());
    }

    /// Drop tracking for a symbol removed from the watchlist.
    pub fn forget_symbol(&self, symbol: &str) {
        self.last_tick.write().remove(symbol);
    }

    /// Start a fresh session: clear tick history and reset the baseline so
    /// silent symbols are not instantly critical after a reconnect.
    pub fn reset_session(&self) {
        self.last_tick.write().clear();
        *self.session_started.write() = Instant::now();
    }

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    fn classify(&self, age: Duration) -> SymbolLiveness {
        if age >= self.critical_after {
            SymbolLiveness::Critical
        } else if age >= self.stale_after {
            SymbolLiveness::Stale
        } else {
            SymbolLiveness::Fresh
        }
    }

    /// Classify every desired symbol by tick age.
    pub fn snapshot(&self, desired: &HashSet<String>) -> HealthSnapshot {
        let ticks = self.last_tick.read();
        let baseline = *self.session_started.read();

        let mut snap = HealthSnapshot {
            fresh: 0,
            stale: 0,
            critical: 0,
            total: desired.len(),
            details: Vec::with_capacity(desired.len()),
        };

        for symbol in desired {
            let seen = ticks.get(symbol);
            let age = seen.map_or_else(|| baseline.elapsed(), Instant::elapsed);
            let state = self.classify(age);
            match state {
                SymbolLiveness::Fresh => snap.fresh += 1,
                SymbolLiveness::Stale => snap.stale += 1,
                SymbolLiveness::Critical => snap.critical += 1,
            }
            snap.details.push(SymbolHealthDetail {
                symbol: symbol.clone(),
                state: state.as_str().to_string(),
                seconds_since_tick: seen.map(|t| t.elapsed().as_secs()),
            });
        }

        snap
    }

    /// Decide whether the snapshot warrants tearing down the session.
    pub fn reconnect_reason(&self, snap: &HealthSnapshot) -> Option<String> {
        if snap.total == 0 {
            return None;
        }
        let critical_share = snap.critical as f64 / snap.total as f64;
        if critical_share >= self.critical_fraction {
            return Some(format!(
                "{}/{} symbols critical",
                snap.critical, snap.total
            ));
        }
        let stale_share = (snap.stale + snap.critical) as f64 / snap.total as f64;
        if stale_share >= self.stale_fraction {
            return Some(format!(
                "{}/{} symbols stale or worse",
                snap.stale + snap.critical,
                snap.total
            ));
        }
        None
    }

    // -----------------------------------------------------------------------
    // Periodic loop
    // -----------------------------------------------------------------------

    /// Health check loop. Skips checks while the controller is between
    /// sessions; also watches whole-session inbound silence and escalates
    /// from a warning event to a forced reconnect.
    pub async fn run(
        self: Arc<Self>,
        controller: Arc<ConnectionController>,
        registry: Arc<PairRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stream health monitor stopping");
                        return;
                    }
                }
            }

            if !controller.is_connected() {
                continue;
            }

            // Whole-session silence check first; it catches half-open
            // sockets that per-symbol ages alone would blame on the market.
            if let Some(age) = controller.last_inbound_age_secs() {
                if age >= self.session_force.as_secs() {
                    warn!(age_secs = age, "no inbound frames — forcing reconnect");
                    controller.force_reconnect("session silent too long");
                    continue;
                }
                if age >= self.session_warning.as_secs() {
                    warn!(age_secs = age, "no inbound frames — connection may be stalling");
                    self.events.publish(IngestEvent::ConnectionStatus {
                        status: ConnectionStatus::Warning,
                        pairs_count: registry.len(),
                        subscribed_count: 0,
                        pending_count: 0,
                        reason: Some(format!("no inbound frames for {age}s")),
                        timestamp: now_rfc3339(),
                    });
                }
            }

            let snap = self.snapshot(&registry.snapshot());
            self.events.publish(IngestEvent::StreamHealth {
                fresh_count: snap.fresh,
                stale_count: snap.stale,
                critical_count: snap.critical,
                total_pairs: snap.total,
                symbols: snap.details.clone(),
                timestamp: now_rfc3339(),
            });

            if let Some(reason) = self.reconnect_reason(&snap) {
                warn!(%reason, "stream health degraded — forcing reconnect");
                controller.force_reconnect(&reason);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn desired(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn recent_ticks_are_fresh() {
        let m = StreamHealthMonitor::with_thresholds(
            Duration::from_secs(90),
            Duration::from_secs(180),
        );
        m.record_tick("BTCUSDT");
        m.record_tick("ETHUSDT");

        let snap = m.snapshot(&desired(&["BTCUSDT", "ETHUSDT"]));
        assert_eq!(snap.fresh, 2);
        assert_eq!(snap.stale, 0);
        assert_eq!(snap.critical, 0);
        assert_eq!(snap.total, 2);
    }

    #[tokio::test]
    async fn aged_ticks_degrade() {
        let m = StreamHealthMonitor::with_thresholds(
            Duration::from_millis(30),
            Duration::from_millis(80),
        );
        m.record_tick("STALE");
        tokio::time::sleep(Duration::from_millis(45)).await;
        m.record_tick("FRESH");

        let snap = m.snapshot(&desired(&["FRESH", "STALE"]));
        assert_eq!(snap.fresh, 1);
        assert_eq!(snap.stale, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = m.snapshot(&desired(&["FRESH", "STALE"]));
        assert_eq!(snap.critical, 1);
    }

    #[tokio::test]
    async fn unseen_symbols_age_from_session_start() {
        let m = StreamHealthMonitor::with_thresholds(
            Duration::from_millis(20),
            Duration::from_millis(1_000),
        );
        m.reset_session();
        tokio::time::sleep(Duration::from_millis(35)).await;

        let snap = m.snapshot(&desired(&["NEVERSEEN"]));
        assert_eq!(snap.stale, 1);
        assert_eq!(snap.details[0].seconds_since_tick, None);
    }

    #[tokio::test]
    async fn reset_restores_baseline() {
        let m = StreamHealthMonitor::with_thresholds(
            Duration::from_millis(20),
            Duration::from_millis(40),
        );
        m.record_tick("BTCUSDT");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(m.snapshot(&desired(&["BTCUSDT"])).critical, 1);

        m.reset_session();
        let snap = m.snapshot(&desired(&["BTCUSDT"]));
        assert_eq!(snap.fresh, 1);
        assert_eq!(snap.details[0].seconds_since_tick, None);
    }

    #[tokio::test]
    async fn reconnect_fires_on_critical_fraction() {
        // Defaults: 30 % critical or 50 % stale-or-worse.
        let m = StreamHealthMonitor::new(&IngestConfig::default(), EventBus::new(16));

        let reason = m.reconnect_reason(&HealthSnapshot {
            fresh: 6,
            stale: 0,
            critical: 4,
            total: 10,
            details: vec![],
        });
        assert!(reason.unwrap().contains("critical"));

        let reason = m.reconnect_reason(&HealthSnapshot {
            fresh: 4,
            stale: 6,
            critical: 0,
            total: 10,
            details: vec![],
        });
        assert!(reason.unwrap().contains("stale"));

        assert!(m
            .reconnect_reason(&HealthSnapshot {
                fresh: 9,
                stale: 1,
                critical: 0,
                total: 10,
                details: vec![],
            })
            .is_none());

        // Empty watchlist never triggers.
        assert!(m
            .reconnect_reason(&HealthSnapshot {
                fresh: 0,
                stale: 0,
                critical: 0,
                total: 0,
                details: vec![],
            })
            .is_none());
    }

    #[tokio::test]
    async fn forget_symbol_drops_tracking() {
        let m = StreamHealthMonitor::with_thresholds(
            Duration::from_secs(90),
            Duration::from_secs(180),
        );
        m.record_tick("BTCUSDT");
        m.forget_symbol("BTCUSDT");
        let snap = m.snapshot(&desired(&["BTCUSDT"]));
        assert_eq!(snap.details[0].seconds_since_tick, None);
    }
}
