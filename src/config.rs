// =============================================================================
// Ingestion Configuration — every tunable in one place
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::CoverageThresholds;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_retention_hours() -> u32 {
    2
}

fn default_analysis_hours() -> u32 {
    1
}

fn default_reconnect_base_delay_secs() -> u64 {
    5
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_connection_stable_secs() -> u64 {
    60
}

fn default_subscribe_batch_size() -> usize {
    50
}

fn default_subscribe_batch_delay_ms() -> u64 {
    500
}

fn default_retry_failed_interval_secs() -> u64 {
    60
}

fn default_pairs_check_interval_minutes() -> u64 {
    30
}

fn default_window_reconcile_interval_secs() -> u64 {
    1800
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_backfill_page_limit() -> usize {
    1000
}

fn default_backfill_page_delay_ms() -> u64 {
    250
}

fn default_gap_backfill_threshold() -> u64 {
    5
}

fn default_data_load_cooldown_secs() -> u64 {
    300
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_symbol_stale_secs() -> u64 {
    90
}

fn default_symbol_critical_secs() -> u64 {
    180
}

fn default_session_warning_secs() -> u64 {
    90
}

fn default_session_force_secs() -> u64 {
    120
}

fn default_critical_fraction() -> f64 {
    0.30
}

fn default_stale_fraction() -> f64 {
    0.50
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_ws_url() -> String {
    "wss://stream.bybit.com/v5/public/linear".to_string()
}

fn default_rest_url() -> String {
    "https://api.bybit.com".to_string()
}

// =============================================================================
// IngestConfig
// =============================================================================

/// Top-level configuration for the ingestion engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    // --- Symbols & window ----------------------------------------------------

    /// Symbols seeded into the watchlist when storage is empty.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Hours of closed-candle history to keep for display/retention.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,

    /// Additional hours required by downstream analysis.
    #[serde(default = "default_analysis_hours")]
    pub analysis_hours: u32,

    // --- Connection ----------------------------------------------------------

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Base reconnect delay; the n-th attempt waits `min(base * n, max)`.
    #[serde(default = "default_reconnect_base_delay_secs")]
    pub reconnect_base_delay_secs: u64,

    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    /// After this many consecutive failed sessions the controller stops
    /// permanently and the engine reports itself unhealthy.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// A session alive for this long is considered stable and resets the
    /// reconnect attempt counter.
    #[serde(default = "default_connection_stable_secs")]
    pub connection_stable_secs: u64,

    /// Interval between outbound JSON ping frames (Bybit keepalive).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    // --- Subscriptions -------------------------------------------------------

    /// Maximum topics per subscribe/unsubscribe frame (exchange limit).
    #[serde(default = "default_subscribe_batch_size")]
    pub subscribe_batch_size: usize,

    /// Pause between consecutive subscribe batches.
    #[serde(default = "default_subscribe_batch_delay_ms")]
    pub subscribe_batch_delay_ms: u64,

    /// Period of the failed-subscription retry loop.
    #[serde(default = "default_retry_failed_interval_secs")]
    pub retry_failed_interval_secs: u64,

    /// Period of the watchlist refresh loop.
    #[serde(default = "default_pairs_check_interval_minutes")]
    pub pairs_check_interval_minutes: u64,

    // --- Backfill & window maintenance ---------------------------------------

    /// Maximum rows per historical kline request.
    #[serde(default = "default_backfill_page_limit")]
    pub backfill_page_limit: usize,

    /// Pause between consecutive historical pages.
    #[serde(default = "default_backfill_page_delay_ms")]
    pub backfill_page_delay_ms: u64,

    /// Missing-candle count above which a reconcile pass triggers a backfill.
    #[serde(default = "default_gap_backfill_threshold")]
    pub gap_backfill_threshold: u64,

    /// Minimum interval between full loads of the same symbol.
    #[serde(default = "default_data_load_cooldown_secs")]
    pub data_load_cooldown_secs: u64,

    /// Period of the per-window reconciliation loop.
    #[serde(default = "default_window_reconcile_interval_secs")]
    pub window_reconcile_interval_secs: u64,

    /// Period of the coarse hourly purge.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Startup classification thresholds.
    #[serde(default)]
    pub coverage: CoverageThresholds,

    // --- Stream health -------------------------------------------------------

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Seconds without a tick before a symbol is stale.
    #[serde(default = "default_symbol_stale_secs")]
    pub symbol_stale_secs: u64,

    /// Seconds without a tick before a symbol is critical.
    #[serde(default = "default_symbol_critical_secs")]
    pub symbol_critical_secs: u64,

    /// Seconds without any inbound frame before a warning event is emitted.
    #[serde(default = "default_session_warning_secs")]
    pub session_warning_secs: u64,

    /// Seconds without any inbound frame before the session is torn down.
    #[serde(default = "default_session_force_secs")]
    pub session_force_secs: u64,

    /// Fraction of critical symbols that forces a reconnect.
    #[serde(default = "default_critical_fraction")]
    pub critical_fraction: f64,

    /// Fraction of stale symbols that forces a reconnect.
    #[serde(default = "default_stale_fraction")]
    pub stale_fraction: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialise from defaults")
    }
}

impl IngestConfig {
    /// Total hours of history every symbol must cover: retention + analysis
    /// plus one buffer hour, matching what the backfill requests.
    pub fn window_hours(&self) -> u32 {
        self.retention_hours + self.analysis_hours + 1
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            window_hours = config.window_hours(),
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
