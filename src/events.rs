// =============================================================================
// Broadcast collaborator — structured events emitted by the engine
// =============================================================================
//
// The engine publishes typed events onto a tokio broadcast channel. Fan-out
// to external listeners (WebSocket clients, dashboards) is someone else's
// concern; here we only guarantee the events exist and carry full context.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::Candle;

/// Connection status carried by [`IngestEvent::ConnectionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Warning,
}

/// Per-symbol liveness detail inside a health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolHealthDetail {
    pub symbol: String,
    /// "fresh" | "stale" | "critical".
    pub state: String,
    /// Seconds since the last observed tick; `None` if never seen.
    pub seconds_since_tick: Option<u64>,
}

/// Every event the engine emits. The JSON shape (snake_case `type` tag)
/// matches what downstream listeners already consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    ConnectionStatus {
        status: ConnectionStatus,
        pairs_count: usize,
        subscribed_count: usize,
        pending_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: String,
    },
    SubscriptionUpdated {
        total_pairs: usize,
        subscribed_count: usize,
        added: Vec<String>,
        removed: Vec<String>,
        timestamp: String,
    },
    StreamHealth {
        fresh_count: usize,
        stale_count: usize,
        critical_count: usize,
        total_pairs: usize,
        symbols: Vec<SymbolHealthDetail>,
        timestamp: String,
    },
    KlineUpdate {
        symbol: String,
        data: Candle,
        is_closed: bool,
        server_timestamp: i64,
        timestamp: String,
    },
}

/// Current UTC time as an RFC 3339 string, used for event timestamps.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Thin wrapper around a broadcast channel. Publishing never fails the
/// engine: if nobody is listening the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: IngestEvent) {
        // A send error only means there are currently no receivers.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
