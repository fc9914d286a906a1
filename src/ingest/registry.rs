// =============================================================================
// PairRegistry — the desired symbol set, refreshed from storage
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::storage::CandleStore;

/// Owns the current set of symbols the engine must track. Source of truth is
/// the storage watchlist; [`PairRegistry::refresh`] diffs against it.
///
/// All reads by other components go through [`snapshot`]/[`contains`] — the
/// set itself is never handed out mutably.
///
/// [`snapshot`]: PairRegistry::snapshot
/// [`contains`]: PairRegistry::contains
pub struct PairRegistry {
    store: Arc<dyn CandleStore>,
    desired: RwLock<HashSet<String>>,
}

impl PairRegistry {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self {
            store,
            desired: RwLock::new(HashSet::new()),
        }
    }

    /// Initial load of the watchlist. Startup aborts if storage is
    /// unreachable; an empty watchlist is allowed (the engine idles).
    pub async fn load(&self) -> Result<usize> {
        let symbols = self
            .store
            .desired_symbols()
            .await
            .context("failed to load watchlist from storage")?;

        let count = symbols.len();
        if count == 0 {
            warn!("watchlist is empty — waiting for symbols to be added");
        } else {
            info!(count, "watchlist loaded");
        }

        *self.desired.write() = symbols;
        Ok(count)
    }

    /// Re-read the watchlist and apply the diff. Returns `(added, removed)`.
    pub async fn refresh(&self) -> Result<(Vec<String>, Vec<String>)> {
        let current = self
            .store
            .desired_symbols()
            .await
            .context("failed to refresh watchlist from storage")?;

        let mut desired = self.desired.write();
        let added: Vec<String> = current.difference(&desired).cloned().collect();
        let removed: Vec<String> = desired.difference(&current).cloned().collect();

        if !added.is_empty() || !removed.is_empty() {
            info!(
                added = added.len(),
                removed = removed.len(),
                total = current.len(),
                "watchlist changed"
            );
            *desired = current;
        }

        Ok((added, removed))
    }

    /// Copy of the desired set.
    pub fn snapshot(&self) -> HashSet<String> {
        self.desired.read().clone()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.desired.read().contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.desired.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.read().is_empty()
    }
}
