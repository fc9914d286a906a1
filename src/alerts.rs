// =============================================================================
// Alert collaborator — closed candles handed off for evaluation
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::types::Candle;

/// Consumer of closed candles. Invoked fire-and-forget from the tick handler;
/// the engine does not depend on the result.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn on_closed_candle(&self, symbol: &str, candle: &Candle);
}

/// Default sink that only traces. Stands in until a real alert evaluator is
/// wired up.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn on_closed_candle(&self, symbol: &str, candle: &Candle) {
        debug!(
            symbol = %symbol,
            start_ms = candle.start_ms,
            close = candle.close,
            "closed candle forwarded to alert sink"
        );
    }
}
