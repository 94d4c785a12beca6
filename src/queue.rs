//! Change queue: a single-slot pending-intent register in front of the
//! apply coordinator.
//!
//! Intents that arrive while the slot is full are merged into it, so a burst
//! of edits yields one run, and edits that arrive mid-run yield exactly one
//! follow-up run.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info};

use crate::apply::{ApplyCoordinator, ApplyIntent, ApplyReport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    /// Intents folded into an already pending one
    pub coalesced: u64,
}

pub struct ChangeQueue {
    coordinator: Arc<ApplyCoordinator>,
    pending: Mutex<Option<ApplyIntent>>,
    notify: Notify,
    debounce: Duration,
    reports: broadcast::Sender<ApplyReport>,
    enqueued: AtomicU64,
    coalesced: AtomicU64,
}

impl ChangeQueue {
    pub fn new(coordinator: Arc<ApplyCoordinator>, debounce: Duration) -> Arc<Self> {
        let (reports, _) = broadcast::channel(16);
        Arc::new(Self {
            coordinator,
            pending: Mutex::new(None),
            notify: Notify::new(),
            debounce,
            reports,
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        })
    }

    /// Put `intent` in the pending slot, merging with whatever is there
    pub fn enqueue(&self, intent: ApplyIntent) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.pending.lock();
            let merged = match slot.take() {
                Some(existing) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    merge(existing, intent)
                }
                None => intent,
            };
            debug!(revision = merged.revision, force = merged.force, "Apply intent pending");
            *slot = Some(merged);
        }
        self.notify.notify_one();
    }

    pub fn pending(&self) -> Option<ApplyIntent> {
        self.pending.lock().clone()
    }

    /// Reports of every run started by the queue
    pub fn subscribe(&self) -> broadcast::Receiver<ApplyReport> {
        self.reports.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Worker loop. Waits for an intent, lets the debounce window pass, then
    /// runs the coordinator for whatever is in the slot at that moment.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(debounce_ms = self.debounce.as_millis() as u64, "Change queue started");

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.debounce) => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }

            // A wake-up whose intent was already taken by the previous run
            let Some(intent) = self.pending.lock().take() else {
                continue;
            };

            let mut cancel = shutdown_rx.clone();
            let report = self.coordinator.apply(intent, &mut cancel).await;
            let _ = self.reports.send(report);
        }

        if let Some(intent) = self.pending.lock().take() {
            info!(revision = intent.revision, "Dropping pending apply intent on shutdown");
        }
        info!("Change queue stopped");
    }
}

/// The intent with the higher revision wins (the newer one on ties); a
/// forced request stays forced.
fn merge(existing: ApplyIntent, incoming: ApplyIntent) -> ApplyIntent {
    let force = existing.force || incoming.force;
    let mut winner = if incoming.revision >= existing.revision {
        incoming
    } else {
        existing
    };
    winner.force = force;
    winner
}
