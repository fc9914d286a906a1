// =============================================================================
// Candlekeeper — Main Entry Point
// =============================================================================
//
// Minute-candle ingestion engine for Bybit linear perpetuals: live kline
// stream plus historical backfill, kept reconciled against a rolling window.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod bybit;
mod config;
mod events;
mod ingest;
mod storage;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::LogAlertSink;
use crate::config::IngestConfig;
use crate::events::EventBus;
use crate::ingest::IngestionOrchestrator;
use crate::storage::MemoryCandleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Candlekeeper — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::var("CANDLEKEEPER_CONFIG")
        .unwrap_or_else(|_| "candlekeeper.json".to_string());
    let mut config = IngestConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = IngestConfig::default();
        // Persist the defaults so the file exists for editing.
        if let Err(save_err) = defaults.save(&config_path) {
            warn!(error = %save_err, "Failed to write default config");
        }
        defaults
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("CANDLEKEEPER_SYMBOLS") {
        let parsed: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            config.symbols = parsed;
        }
    }

    info!(
        symbols = ?config.symbols,
        window_hours = config.window_hours(),
        ws_url = %config.ws_url,
        "Configured ingestion"
    );

    // ── 2. Storage & collaborators ───────────────────────────────────────
    let store = Arc::new(MemoryCandleStore::new());
    store.add_symbols(config.symbols.iter().cloned());

    let events = EventBus::default();
    let alerts = Arc::new(LogAlertSink);

    // ── 3. Orchestrator ──────────────────────────────────────────────────
    let orchestrator = IngestionOrchestrator::new(config, store, alerts, events);

    // Forward engine events to the log; real consumers attach through the
    // same broadcast handle.
    let mut event_rx = orchestrator.events().subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match event_rx.recv().await {
                Ok(event) => tracing::debug!(?event, "engine event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    orchestrator.start().await?;

    // ── 4. Run until signal or permanent connection loss ─────────────────
    let mut health_tick = tokio::time::interval(Duration::from_secs(5));
    health_tick.tick().await;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
            _ = health_tick.tick() => {
                if !orchestrator.is_healthy() {
                    error!("Connection permanently lost — shutting down");
                    break;
                }
            }
        }
    }

    orchestrator.shutdown().await;
    info!("Candlekeeper stopped");
    Ok(())
}
