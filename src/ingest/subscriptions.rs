// =============================================================================
// SubscriptionManager — desired vs. actual subscription state per symbol
// =============================================================================
//
// Owns the pending / subscribed / failed sets. Subscribe and unsubscribe
// frames go out through the current session's command channel; a dead or
// absent channel fails the batch. Confirmation is implicit: receiving a tick
// for a symbol is proof of a working subscription (the exchange ack does not
// identify which topics in a batch succeeded).
// =============================================================================

use std::collections::HashSet;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::bybit::ws;
use crate::events::{now_rfc3339, EventBus, IngestEvent};

/// Counts exposed to health snapshots and status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionCounts {
    pub subscribed: usize,
    pub pending: usize,
    pub failed: usize,
}

#[derive(Default)]
struct SubscriptionSets {
    pending: HashSet<String>,
    subscribed: HashSet<String>,
    failed: HashSet<String>,
}

impl SubscriptionSets {
    fn forget(&mut self, symbol: &str) {
        self.pending.remove(symbol);
        self.subscribed.remove(symbol);
        self.failed.remove(symbol);
    }
}

/// Tracks subscription state and issues batched (un)subscribe commands.
pub struct SubscriptionManager {
    batch_size: usize,
    batch_delay: std::time::Duration,
    sets: RwLock<SubscriptionSets>,
    /// Outbound command channel of the active session, if any. Rebound on
    /// every new session; `None` while disconnected.
    session_tx: RwLock<Option<UnboundedSender<String>>>,
    events: EventBus,
}

impl SubscriptionManager {
    pub fn new(batch_size: usize, batch_delay_ms: u64, events: EventBus) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_delay: std::time::Duration::from_millis(batch_delay_ms),
            sets: RwLock::new(SubscriptionSets::default()),
            session_tx: RwLock::new(None),
            events,
        }
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    /// Attach a fresh session. Subscriptions do not survive reconnects, so
    /// all tracking state is dropped; the caller follows up with a full
    /// [`reconcile`](Self::reconcile).
    pub fn bind_session(&self, tx: UnboundedSender<String>) {
        *self.sets.write() = SubscriptionSets::default();
        *self.session_tx.write() = Some(tx);
        debug!("subscription state reset for new session");
    }

    /// Detach the session. Kept state becomes meaningless and is cleared.
    pub fn clear_session(&self) {
        *self.session_tx.write() = None;
        *self.sets.write() = SubscriptionSets::default();
    }

    fn send_frame(&self, frame: String) -> bool {
        match self.session_tx.read().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Bring actual subscription state in line with `desired`.
    ///
    /// Symbols no longer desired are unsubscribed (and forgotten even if the
    /// send fails — the exchange drops them with the session anyway); new
    /// symbols are subscribed in batches and marked pending, or failed when
    /// the batch cannot be sent.
    pub async fn reconcile(&self, desired: &HashSet<String>) {
        let (to_subscribe, to_unsubscribe) = {
            let sets = self.sets.read();
            let to_subscribe: Vec<String> = desired
                .iter()
                .filter(|s| !sets.subscribed.contains(*s) && !sets.pending.contains(*s))
                .cloned()
                .collect();
            let to_unsubscribe: Vec<String> = sets
                .subscribed
                .union(&sets.pending)
                .chain(sets.failed.iter())
                .filter(|s| !desired.contains(*s))
                .cloned()
                .collect();
            (to_subscribe, to_unsubscribe)
        };

        if to_subscribe.is_empty() && to_unsubscribe.is_empty() {
            return;
        }

        if !to_unsubscribe.is_empty() {
            for batch in to_unsubscribe.chunks(self.batch_size) {
                if !self.send_frame(ws::unsubscribe_frame(batch)) {
                    warn!(count = batch.len(), "unsubscribe batch not sent (no session)");
                }
            }
            let mut sets = self.sets.write();
            for symbol in &to_unsubscribe {
                sets.forget(symbol);
            }
            info!(count = to_unsubscribe.len(), "unsubscribed removed symbols");
        }

        if !to_subscribe.is_empty() {
            self.subscribe_batches(&to_subscribe).await;
        }

        let counts = self.counts();
        self.events.publish(IngestEvent::SubscriptionUpdated {
            total_pairs: desired.len(),
            subscribed_count: counts.subscribed,
            added: to_subscribe,
            removed: to_unsubscribe,
            timestamp: now_rfc3339(),
        });
    }

    /// Send subscribe frames in batches, pausing between them to respect
    /// exchange rate limits. Each batch lands wholesale in `pending` or, if
    /// the send fails, in `failed`.
    async fn subscribe_batches(&self, symbols: &[String]) {
        let batches: Vec<Vec<String>> = symbols
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let total = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            let sent = self.send_frame(ws::subscribe_frame(&batch));
            {
                let mut sets = self.sets.write();
                for symbol in &batch {
                    sets.forget(symbol);
                }
                if sent {
                    sets.pending.extend(batch.iter().cloned());
                } else {
                    sets.failed.extend(batch.iter().cloned());
                }
            }

            if sent {
                info!(batch = i + 1, of = total, count = batch.len(), "subscribe batch sent");
            } else {
                warn!(
                    batch = i + 1,
                    of = total,
                    count = batch.len(),
                    "subscribe batch failed — symbols marked for retry"
                );
            }

            if i + 1 < total {
                tokio::time::sleep(self.batch_delay).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Liveness-driven promotion
    // -------------------------------------------------------------------------

    /// A tick arrived for `symbol`: the subscription demonstrably works.
    /// Promotes pending/failed symbols to subscribed. Returns true if the
    /// symbol changed state.
    pub fn on_tick_observed(&self, symbol: &str) -> bool {
        let mut sets = self.sets.write();
        let was_elsewhere = sets.pending.remove(symbol) || sets.failed.remove(symbol);
        let newly_subscribed = sets.subscribed.insert(symbol.to_string());
        was_elsewhere || newly_subscribed
    }

    // -------------------------------------------------------------------------
    // Failed-batch retry
    // -------------------------------------------------------------------------

    /// Re-issue subscribe commands for everything in `failed`. Runs on its
    /// own timer so a noisy batch cannot block new-symbol subscription.
    /// Returns the number of symbols retried.
    pub async fn retry_failed(&self) -> usize {
        let failed: Vec<String> = {
            let mut sets = self.sets.write();
            sets.failed.drain().collect()
        };

        if failed.is_empty() {
            return 0;
        }

        info!(count = failed.len(), "retrying failed subscriptions");
        self.subscribe_batches(&failed).await;
        failed.len()
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn counts(&self) -> SubscriptionCounts {
        let sets = self.sets.read();
        SubscriptionCounts {
            subscribed: sets.subscribed.len(),
            pending: sets.pending.len(),
            failed: sets.failed.len(),
        }
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.sets.read().subscribed.contains(symbol)
    }

    pub fn is_pending(&self, symbol: &str) -> bool {
        self.sets.read().pending.contains(symbol)
    }

    pub fn is_failed(&self, symbol: &str) -> bool {
        self.sets.read().failed.contains(symbol)
    }
}
