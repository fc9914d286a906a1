// =============================================================================
// Core data types — candles, retention windows, integrity reports
// =============================================================================

use serde::{Deserialize, Serialize};

/// One minute in milliseconds. Every candle key is aligned to this.
pub const MINUTE_MS: i64 = 60_000;

/// Round an epoch-millisecond timestamp down to the start of its minute.
pub fn minute_floor(ts_ms: i64) -> i64 {
    (ts_ms / MINUTE_MS) * MINUTE_MS
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single one-minute OHLCV candle.
///
/// `closed == false` marks a live, in-progress candle whose fields are still
/// being updated by the stream. Closed candles are immutable once stored;
/// writes with the same `(symbol, start_ms)` key overwrite idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start_ms: i64,
    pub end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

impl Candle {
    /// True if this candle spans exactly one minute starting on a minute
    /// boundary — required for every closed candle we store.
    pub fn is_minute_aligned(&self) -> bool {
        self.start_ms % MINUTE_MS == 0 && self.end_ms == self.start_ms + MINUTE_MS
    }
}

// ---------------------------------------------------------------------------
// RetentionWindow
// ---------------------------------------------------------------------------

/// The authoritative half-open time range `[start_ms, end_ms)` of history a
/// symbol must retain. Recomputed against "now" on every reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl RetentionWindow {
    /// Compute the window ending at the current minute boundary and reaching
    /// back `hours` hours.
    pub fn compute(now_ms: i64, hours: u32) -> Self {
        let end_ms = minute_floor(now_ms);
        Self {
            start_ms: end_ms - (hours as i64) * 60 * MINUTE_MS,
            end_ms,
        }
    }

    /// Number of one-minute candles the window is expected to contain.
    pub fn expected_candles(&self) -> u64 {
        ((self.end_ms - self.start_ms) / MINUTE_MS).max(0) as u64
    }

    pub fn contains(&self, start_ms: i64) -> bool {
        start_ms >= self.start_ms && start_ms < self.end_ms
    }
}

impl std::fmt::Display for RetentionWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

// ---------------------------------------------------------------------------
// DataIntegrityReport
// ---------------------------------------------------------------------------

/// Expected-vs-actual candle count over a time range. Purely derived, never
/// stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataIntegrityReport {
    pub expected_count: u64,
    pub existing_count: u64,
    pub missing_count: u64,
    pub integrity_pct: f64,
}

impl DataIntegrityReport {
    pub fn new(expected_count: u64, existing_count: u64) -> Self {
        let missing_count = expected_count.saturating_sub(existing_count);
        let integrity_pct = if expected_count > 0 {
            existing_count as f64 / expected_count as f64 * 100.0
        } else {
            0.0
        };
        Self {
            expected_count,
            existing_count,
            missing_count,
            integrity_pct,
        }
    }
}

// ---------------------------------------------------------------------------
// Coverage classification
// ---------------------------------------------------------------------------

/// Thresholds used by [`classify_coverage`]. Lives in the config so the
/// numbers exist in exactly one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageThresholds {
    /// Integrity percentage at or above which data counts as sufficient.
    #[serde(default = "default_min_integrity_pct")]
    pub min_integrity_pct: f64,
    /// Candle count at or above which data counts as sufficient.
    #[serde(default = "default_min_candles")]
    pub min_candles: u64,
    /// Candle count floor for the partial-top-up classification.
    #[serde(default = "default_partial_min_candles")]
    pub partial_min_candles: u64,
    /// Integrity floor for the partial-top-up classification.
    #[serde(default = "default_partial_min_integrity_pct")]
    pub partial_min_integrity_pct: f64,
    /// Maximum age (seconds) of the newest stored candle before the data is
    /// treated as outdated regardless of count.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_min_integrity_pct() -> f64 {
    80.0
}
fn default_min_candles() -> u64 {
    60
}
fn default_partial_min_candles() -> u64 {
    20
}
fn default_partial_min_integrity_pct() -> f64 {
    60.0
}
fn default_max_age_secs() -> u64 {
    7200
}

impl Default for CoverageThresholds {
    fn default() -> Self {
        Self {
            min_integrity_pct: default_min_integrity_pct(),
            min_candles: default_min_candles(),
            partial_min_candles: default_partial_min_candles(),
            partial_min_integrity_pct: default_partial_min_integrity_pct(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

/// How a symbol's stored history compares to its retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCoverage {
    /// Fresh and complete enough — no network call needed.
    Sufficient,
    /// Scattered gaps — top up the whole window.
    Partial,
    /// Plenty of candles but the newest one is old — refresh the recent tail.
    Outdated,
    /// Too little usable data — load the full window.
    NeedsFullLoad,
}

impl std::fmt::Display for DataCoverage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataCoverage::Sufficient => "sufficient",
            DataCoverage::Partial => "partial",
            DataCoverage::Outdated => "outdated",
            DataCoverage::NeedsFullLoad => "needs_full_load",
        };
        f.write_str(s)
    }
}

/// Classify a symbol's stored history.
///
/// `age_secs` is the age of the newest stored candle in the window; `None`
/// means no candle exists at all.
pub fn classify_coverage(
    report: &DataIntegrityReport,
    age_secs: Option<u64>,
    t: &CoverageThresholds,
) -> DataCoverage {
    let age = match age_secs {
        Some(a) => a,
        None => return DataCoverage::NeedsFullLoad,
    };

    let fresh = age <= t.max_age_secs;
    let count = report.existing_count;

    if fresh && report.integrity_pct >= t.min_integrity_pct && count >= t.min_candles {
        return DataCoverage::Sufficient;
    }
    if fresh
        && count >= t.partial_min_candles
        && report.integrity_pct >= t.partial_min_integrity_pct
    {
        return DataCoverage::Partial;
    }
    if !fresh && count >= t.min_candles {
        return DataCoverage::Outdated;
    }
    DataCoverage::NeedsFullLoad
}
