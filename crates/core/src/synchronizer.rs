//! Session synchronizer
//!
//! Maintains a live subscription to the store's change channel, filtered to
//! sessions involving the current identity, and forwards typed events into
//! the manager's command queue. Change channels do not guarantee delivery
//! across disconnects, so every (re)connect is followed by a reconciliation
//! fetch of the full active-session set; a lagged subscriber takes the same
//! path. Connection loss is retried with capped exponential backoff.

use std::time::Duration;

use mentorview_protocol::{now_millis, SessionChangeEvent};
use mentorview_store::StoreHandle;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::manager::{ContextCommand, SyncEvent};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const JITTER_MILLIS: u64 = 250;

/// Handle to a running synchronizer task (cheap to Clone)
#[derive(Clone)]
pub struct SynchronizerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SynchronizerHandle {
    /// Stop the synchronizer. Safe to call any number of times.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the synchronizer task feeding the given manager queue
pub fn spawn(
    store: StoreHandle,
    self_id: String,
    events_tx: mpsc::Sender<ContextCommand>,
) -> SynchronizerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run(store, self_id, events_tx, shutdown_rx));
    SynchronizerHandle { shutdown_tx }
}

enum LoopExit {
    Shutdown,
    ManagerGone,
    /// Channel closed: treat as connection loss, back off before retrying
    Lost,
    /// Fell behind the channel buffer: still connected, reconcile now
    Lagged,
}

async fn run(
    store: StoreHandle,
    self_id: String,
    events_tx: mpsc::Sender<ContextCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        component = "synchronizer",
        event = "sync.started",
        identity = %self_id,
        "Session synchronizer started"
    );

    let mut attempt: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if attempt > 0 && !sleep_backoff(attempt, &mut shutdown_rx).await {
            break;
        }

        let changes = match store.subscribe_changes().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(
                    component = "synchronizer",
                    event = "sync.subscribe.failed",
                    error = %e,
                    attempt,
                    "Failed to subscribe to store changes"
                );
                attempt += 1;
                continue;
            }
        };

        // Mandatory reconciliation: correct for anything missed while the
        // subscription was down
        match reconcile(&store, &self_id).await {
            Ok(event) => {
                if events_tx.send(ContextCommand::Sync(event)).await.is_err() {
                    break;
                }
                if attempt > 0 {
                    info!(
                        component = "synchronizer",
                        event = "sync.recovered",
                        attempt,
                        "Reconnected and reconciled"
                    );
                }
                attempt = 0;
            }
            Err(e) => {
                warn!(
                    component = "synchronizer",
                    event = "sync.reconcile.failed",
                    error = %e,
                    attempt,
                    "Reconciliation fetch failed"
                );
                attempt += 1;
                continue;
            }
        }

        match forward_changes(changes, &self_id, &events_tx, &mut shutdown_rx).await {
            LoopExit::Shutdown | LoopExit::ManagerGone => break,
            LoopExit::Lost => {
                let _ = events_tx
                    .send(ContextCommand::Sync(SyncEvent::Disconnected))
                    .await;
                attempt += 1;
            }
            LoopExit::Lagged => {
                let _ = events_tx
                    .send(ContextCommand::Sync(SyncEvent::Disconnected))
                    .await;
                // Still connected; resubscribe and reconcile immediately
                attempt = 0;
            }
        }
    }

    debug!(
        component = "synchronizer",
        event = "sync.stopped",
        identity = %self_id,
        "Session synchronizer stopped"
    );
}

async fn reconcile(store: &StoreHandle, self_id: &str) -> Result<SyncEvent, mentorview_protocol::DelegationError> {
    let sessions = store.list_active_for(self_id).await?;
    let targets = store.list_eligible_for(self_id).await?;
    debug!(
        component = "synchronizer",
        event = "sync.reconciled",
        active_sessions = sessions.len(),
        eligible_targets = targets.len(),
        "Reconciliation fetch complete"
    );
    Ok(SyncEvent::Reconciled { sessions, targets })
}

async fn forward_changes(
    mut changes: broadcast::Receiver<mentorview_store::ChangeNotice>,
    self_id: &str,
    events_tx: &mpsc::Sender<ContextCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> LoopExit {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return LoopExit::Shutdown;
                }
            }
            result = changes.recv() => match result {
                Ok((kind, session)) => {
                    if !session.involves(self_id) {
                        continue;
                    }
                    let event = SyncEvent::Changed(SessionChangeEvent { kind, session });
                    if events_tx.send(ContextCommand::Sync(event)).await.is_err() {
                        return LoopExit::ManagerGone;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "synchronizer",
                        event = "sync.channel.lagged",
                        skipped,
                        "Change subscriber lagged, reconciling"
                    );
                    return LoopExit::Lagged;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(
                        component = "synchronizer",
                        event = "sync.channel.closed",
                        "Change channel closed, reconnecting"
                    );
                    return LoopExit::Lost;
                }
            }
        }
    }
}

/// Returns false when shutdown fired during the wait
async fn sleep_backoff(attempt: u32, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << (attempt - 1).min(5));
    let jitter = Duration::from_millis(now_millis() % JITTER_MILLIS);
    let delay = exp.min(BACKOFF_CAP) + jitter;
    debug!(
        component = "synchronizer",
        event = "sync.backoff",
        attempt,
        delay_ms = delay.as_millis() as u64,
        "Backing off before reconnect"
    );
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
    }
}
