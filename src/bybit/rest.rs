// =============================================================================
// Bybit REST client — historical kline pages (public, unsigned)
// =============================================================================
//
// Only one endpoint matters to the engine: GET /v5/market/kline. Bybit
// returns rows newest-first inside `result.list`; the caller (Backfiller)
// reverses them into chronological order.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::types::{Candle, MINUTE_MS};

/// Source of historical one-minute klines. The REST client implements this;
/// tests use a scripted source.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Fetch up to `limit` one-minute klines covering `[start_ms, end_ms]`.
    /// Rows are returned in exchange order (newest first).
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

/// Bybit v5 REST client for the public linear-category market endpoints.
#[derive(Clone)]
pub struct BybitRestClient {
    base_url: String,
    client: reqwest::Client,
}

impl BybitRestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl KlineSource for BybitRestClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/v5/market/kline?category=linear&symbol={}&interval=1&start={}&end={}&limit={}",
            self.base_url, symbol, start_ms, end_ms, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /v5/market/kline request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse kline response body")?;

        if !status.is_success() {
            anyhow::bail!("Bybit GET /v5/market/kline returned {status}: {body}");
        }

        let candles = parse_kline_response(&body)?;
        debug!(symbol, start_ms, end_ms, count = candles.len(), "kline page fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for BybitRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitRestClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse a full `/v5/market/kline` response body into candles (exchange
/// order preserved — newest first).
///
/// Expected shape:
/// ```json
/// { "retCode": 0, "retMsg": "OK",
///   "result": { "list": [["1700000040000","37000","37050","36990","37020","12.3","455"], ...] } }
/// ```
pub fn parse_kline_response(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let ret_code = body["retCode"].as_i64().context("missing retCode")?;
    if ret_code != 0 {
        let msg = body["retMsg"].as_str().unwrap_or("unknown");
        anyhow::bail!("Bybit kline API error retCode={ret_code}: {msg}");
    }

    let rows = body["result"]["list"]
        .as_array()
        .context("kline response missing result.list")?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        candles.push(parse_kline_row(row)?);
    }
    Ok(candles)
}

/// Parse one kline row. Row indices:
///   [0] startTime (ms), [1] open, [2] high, [3] low, [4] close,
///   [5] volume, [6] turnover — all encoded as strings.
fn parse_kline_row(row: &serde_json::Value) -> Result<Candle> {
    let arr = row.as_array().context("kline row is not an array")?;
    if arr.len() < 6 {
        anyhow::bail!("kline row has only {} elements", arr.len());
    }

    let start_ms: i64 = arr[0]
        .as_str()
        .context("kline row missing start time")?
        .parse()
        .context("failed to parse kline start time")?;

    // Historical rows are always finalized candles.
    Ok(Candle {
        start_ms,
        end_ms: start_ms + MINUTE_MS,
        open: parse_str_f64(&arr[1], "open")?,
        high: parse_str_f64(&arr[2], "high")?,
        low: parse_str_f64(&arr[3], "low")?,
        close: parse_str_f64(&arr[4], "close")?,
        volume: parse_str_f64(&arr[5], "volume")?,
        closed: true,
    })
}

/// Bybit encodes numeric values as JSON strings; tolerate plain numbers too.
pub(crate) fn parse_str_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse {name} '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("field {name} has unexpected JSON type: {val}")
    }
}
