// =============================================================================
// Bybit WebSocket protocol — topics, control frames, inbound classification
// =============================================================================
//
// The public linear stream speaks JSON op frames for control
// ({"op":"subscribe","args":[...]}) and topic-tagged data frames for klines.
// Parsing lives here so the connection loop stays free of wire details.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::json;

use crate::bybit::rest::parse_str_f64;
use crate::types::{minute_floor, Candle, MINUTE_MS};

/// Topic prefix for one-minute klines.
const KLINE_TOPIC_PREFIX: &str = "kline.1.";

/// Build the kline topic for a symbol, e.g. `kline.1.BTCUSDT`.
pub fn kline_topic(symbol: &str) -> String {
    format!("{KLINE_TOPIC_PREFIX}{symbol}")
}

/// Extract the symbol from a kline topic; `None` for any other topic.
pub fn symbol_from_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix(KLINE_TOPIC_PREFIX)
}

/// Build a subscribe control frame for a batch of symbols.
pub fn subscribe_frame(symbols: &[String]) -> String {
    let args: Vec<String> = symbols.iter().map(|s| kline_topic(s)).collect();
    json!({ "op": "subscribe", "args": args }).to_string()
}

/// Build an unsubscribe control frame for a batch of symbols.
pub fn unsubscribe_frame(symbols: &[String]) -> String {
    let args: Vec<String> = symbols.iter().map(|s| kline_topic(s)).collect();
    json!({ "op": "unsubscribe", "args": args }).to_string()
}

/// Bybit keepalive frame. The server answers with a pong ack.
pub fn ping_frame() -> String {
    json!({ "op": "ping" }).to_string()
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// Classified inbound frame from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A kline tick (live or closed) for one symbol.
    Kline { symbol: String, candle: Candle },
    /// Subscribe/unsubscribe acknowledgement. Bybit's ack does not say which
    /// topics of a batch succeeded, so this is informational only.
    Ack { success: bool, ret_msg: String },
    /// Pong reply to our keepalive.
    Pong,
    /// Anything else (other ops, unknown topics) — ignored upstream.
    Ignored,
}

/// Parse one inbound text frame.
///
/// Kline frame shape:
/// ```json
/// { "topic": "kline.1.BTCUSDT",
///   "data": [{ "start": 1700000040000, "end": 1700000100000,
///              "open": "37000", "high": "37050", "low": "36990",
///              "close": "37020", "volume": "12.3", "confirm": false }] }
/// ```
///
/// Closed candles get their timestamps floored to the minute; live ticks
/// keep the raw exchange timestamps.
pub fn parse_inbound(text: &str) -> Result<InboundMessage> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("inbound frame is not valid JSON")?;

    // Control acks carry a top-level `success` flag.
    if let Some(success) = root["success"].as_bool() {
        let ret_msg = root["ret_msg"].as_str().unwrap_or_default().to_string();
        let op = root["op"].as_str().unwrap_or_default();
        if op == "ping" || ret_msg == "pong" {
            return Ok(InboundMessage::Pong);
        }
        return Ok(InboundMessage::Ack { success, ret_msg });
    }

    let Some(topic) = root["topic"].as_str() else {
        return Ok(InboundMessage::Ignored);
    };
    let Some(symbol) = symbol_from_topic(topic) else {
        return Ok(InboundMessage::Ignored);
    };

    let row = root["data"]
        .as_array()
        .and_then(|rows| rows.first())
        .with_context(|| format!("kline frame for {symbol} has no data rows"))?;

    let mut start_ms = row["start"].as_i64().context("kline row missing start")?;
    let mut end_ms = row["end"].as_i64().context("kline row missing end")?;
    let closed = row["confirm"].as_bool().unwrap_or(false);

    if closed {
        start_ms = minute_floor(start_ms);
        end_ms = start_ms + MINUTE_MS;
    }

    let candle = Candle {
        start_ms,
        end_ms,
        open: parse_str_f64(&row["open"], "open")?,
        high: parse_str_f64(&row["high"], "high")?,
        low: parse_str_f64(&row["low"], "low")?,
        close: parse_str_f64(&row["close"], "close")?,
        volume: parse_str_f64(&row["volume"], "volume")?,
        closed,
    };

    Ok(InboundMessage::Kline {
        symbol: symbol.to_string(),
        candle,
    })
}
