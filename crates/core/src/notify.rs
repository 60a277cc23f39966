//! Notification dispatcher
//!
//! Surfaces delegation start/stop to the acting user. Idempotent per
//! session id: one alert when a session transitions into active-affecting-me,
//! dismissed exactly once when it transitions out, even when duplicate
//! events are replayed during reconciliation. Alerts persist until
//! explicitly dismissed; they are not time-limited.

use std::sync::Arc;

use dashmap::DashMap;
use mentorview_protocol::{DelegationError, NotificationEvent, NotificationKind, ViewContext};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tracks which alerts are currently shown, keyed by session id, and fans
/// notification events out to UI subscribers. Cheap to Clone.
#[derive(Clone)]
pub struct NotificationHub {
    shown: Arc<DashMap<String, NotificationKind>>,
    events_tx: broadcast::Sender<NotificationEvent>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shown: Arc::new(DashMap::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events_tx.subscribe()
    }

    /// Alerts currently on screen, for a UI attaching late
    pub fn active_alerts(&self) -> Vec<(String, NotificationKind)> {
        self.shown
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Diff two context snapshots and show/dismiss the affected alerts
    pub fn on_transition(&self, previous: &ViewContext, next: &ViewContext) {
        // Viewer alert: only confirmed sessions, never the optimistic overlay
        let prev_viewing = confirmed_viewing_id(previous);
        let next_viewing = confirmed_viewing_id(next);
        if prev_viewing != next_viewing {
            if let Some(session_id) = prev_viewing {
                self.dismiss(&session_id);
            }
            if let (Some(session_id), Some(target)) = (next_viewing, next.viewing.as_ref()) {
                self.show(
                    session_id,
                    NotificationKind::Viewing {
                        target_id: target.target_id.clone(),
                        target_label: target.target_label.clone(),
                    },
                );
            }
        }

        // Subject alerts: one per active session viewing me
        for viewer in &next.viewed_by {
            self.show(
                viewer.session_id.clone(),
                NotificationKind::BeingViewed {
                    mentor_id: viewer.mentor_id.clone(),
                    mentor_label: viewer.mentor_label.clone(),
                },
            );
        }
        for viewer in &previous.viewed_by {
            if !next
                .viewed_by
                .iter()
                .any(|v| v.session_id == viewer.session_id)
            {
                self.dismiss(&viewer.session_id);
            }
        }
    }

    /// A mutation was attempted and refused; emitted once per attempt
    pub fn read_only_denied(&self) {
        let _ = self.events_tx.send(NotificationEvent::ReadOnlyDenied);
    }

    /// A switch/exit was rejected by the store and rolled back
    pub fn operation_failed(&self, error: &DelegationError) {
        let _ = self.events_tx.send(NotificationEvent::OperationFailed {
            message: error.to_string(),
        });
    }

    fn show(&self, session_id: String, kind: NotificationKind) {
        if self.shown.insert(session_id.clone(), kind.clone()).is_none() {
            debug!(
                component = "notify",
                event = "notify.alert.shown",
                session_id = %session_id,
                "Delegation alert shown"
            );
            let _ = self.events_tx.send(NotificationEvent::Show { session_id, kind });
        }
    }

    fn dismiss(&self, session_id: &str) {
        if self.shown.remove(session_id).is_some() {
            debug!(
                component = "notify",
                event = "notify.alert.dismissed",
                session_id = %session_id,
                "Delegation alert dismissed"
            );
            let _ = self.events_tx.send(NotificationEvent::Dismiss {
                session_id: session_id.to_string(),
            });
        }
    }
}

fn confirmed_viewing_id(ctx: &ViewContext) -> Option<String> {
    ctx.viewing.as_ref().and_then(|v| v.session_id.clone())
}
