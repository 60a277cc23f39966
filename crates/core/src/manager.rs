//! View context manager
//!
//! The single authoritative state machine per client. Runs as one actor
//! task; local operations, synchronizer events, and store replies are all
//! serialized through its command queue, so the reducer never runs
//! concurrently. Consumers read the derived `ViewContext` lock-free via
//! `ArcSwap` or follow the broadcast update stream.
//!
//! Store round trips run in spawned tasks and report back through the same
//! queue, which keeps events flowing while a switch is outstanding and
//! makes a second concurrent operation observable (it is rejected with
//! `ConflictError` rather than queued).

use std::sync::Arc;

use arc_swap::ArcSwap;
use mentorview_protocol::{
    DelegationError, DelegationSession, NotificationEvent, SessionChangeEvent, ViewContext,
};
use mentorview_store::StoreHandle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::guard::MutationGuard;
use crate::notify::NotificationHub;
use crate::synchronizer::{self, SynchronizerHandle};
use crate::transition::{derive_context, transition, ContextState, Effect, Input};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Events produced by the session synchronizer
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// One relevant row change
    Changed(SessionChangeEvent),
    /// Full authoritative state after (re)connecting
    Reconciled {
        sessions: Vec<DelegationSession>,
        targets: Vec<mentorview_protocol::EligibleTarget>,
    },
    /// Change channel lost; local state is stale until the next `Reconciled`
    Disconnected,
}

/// Commands processed by the manager actor
#[derive(Debug)]
pub enum ContextCommand {
    SwitchToTarget {
        target_id: String,
        reply: oneshot::Sender<Result<(), DelegationError>>,
    },
    ReturnToOwn {
        reply: oneshot::Sender<Result<(), DelegationError>>,
    },
    NavigationHint {
        target_id: String,
    },
    Sync(SyncEvent),
    /// Completion of a spawned store round trip
    StoreReply(StoreReply),
}

#[derive(Debug)]
pub enum StoreReply {
    Switched(Result<DelegationSession, DelegationError>),
    Exited {
        session_id: String,
        result: Result<Option<DelegationSession>, DelegationError>,
    },
}

/// Handle to the running manager (cheap to Clone). The process-scoped
/// entry point for everything delegation: snapshots, operations, the
/// guard, and notifications.
#[derive(Clone)]
pub struct ContextHandle {
    cmd_tx: mpsc::Sender<ContextCommand>,
    snapshot: Arc<ArcSwap<ViewContext>>,
    updates_tx: broadcast::Sender<Arc<ViewContext>>,
    notifier: NotificationHub,
    sync: SynchronizerHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl ContextHandle {
    /// Spawn the manager actor and its synchronizer for the given identity
    pub fn spawn(self_id: &str, store: StoreHandle) -> ContextHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(ViewContext::initial(
            self_id.to_string(),
        )));
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let notifier = NotificationHub::new();
        let sync = synchronizer::spawn(store.clone(), self_id.to_string(), cmd_tx.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = ContextManager {
            state: ContextState::new(self_id.to_string()),
            snapshot: snapshot.clone(),
            updates_tx: updates_tx.clone(),
            notifier: notifier.clone(),
            store,
            // Weak: the actor must not keep its own queue alive once all
            // handles and the synchronizer are gone
            cmd_tx: cmd_tx.downgrade(),
            pending: None,
        };
        tokio::spawn(manager.run(cmd_rx, shutdown_rx));

        ContextHandle {
            cmd_tx,
            snapshot,
            updates_tx,
            notifier,
            sync,
            shutdown_tx,
        }
    }

    /// Lock-free snapshot read
    pub fn snapshot(&self) -> Arc<ViewContext> {
        self.snapshot.load_full()
    }

    /// Follow every published context update
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ViewContext>> {
        self.updates_tx.subscribe()
    }

    /// Follow user-visible notification events
    pub fn notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notifier.subscribe()
    }

    /// Gate for mutating operations, bound to this manager's snapshot
    pub fn guard(&self) -> MutationGuard {
        MutationGuard::new(self.snapshot.clone(), self.notifier.clone())
    }

    /// Assume a read-only view of the given mentee. Applies the transition
    /// optimistically; resolves when the store confirms or rejects.
    pub async fn switch_to_target(&self, target_id: &str) -> Result<(), DelegationError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ContextCommand::SwitchToTarget {
                target_id: target_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| DelegationError::transport("view context manager is gone"))?;
        rx.await
            .map_err(|_| DelegationError::transport("switch result discarded"))?
    }

    /// End the current delegated view and return to the own account
    pub async fn return_to_own(&self) -> Result<(), DelegationError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ContextCommand::ReturnToOwn { reply })
            .await
            .map_err(|_| DelegationError::transport("view context manager is gone"))?;
        rx.await
            .map_err(|_| DelegationError::transport("exit result discarded"))?
    }

    /// Feed a target identity recovered from navigation state. Only honored
    /// once a matching active session is confirmed by reconciliation.
    pub async fn navigation_hint(&self, target_id: &str) {
        let _ = self
            .cmd_tx
            .send(ContextCommand::NavigationHint {
                target_id: target_id.to_string(),
            })
            .await;
    }

    /// Tear down the actor and its synchronizer. Safe to call repeatedly;
    /// in-flight store operations complete server-side but their local
    /// results are discarded.
    pub fn shutdown(&self) {
        self.sync.shutdown();
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct ContextManager {
    state: ContextState,
    snapshot: Arc<ArcSwap<ViewContext>>,
    updates_tx: broadcast::Sender<Arc<ViewContext>>,
    notifier: NotificationHub,
    store: StoreHandle,
    cmd_tx: mpsc::WeakSender<ContextCommand>,
    /// Reply slot of the one outstanding switch/exit operation
    pending: Option<oneshot::Sender<Result<(), DelegationError>>>,
}

impl ContextManager {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ContextCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            component = "manager",
            event = "manager.started",
            identity = %self.state.self_id,
            "View context manager started"
        );

        loop {
            let cmd = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match cmd {
                ContextCommand::SwitchToTarget { target_id, reply } => {
                    self.handle_switch(target_id, reply);
                }
                ContextCommand::ReturnToOwn { reply } => self.handle_return(reply),
                ContextCommand::NavigationHint { target_id } => {
                    self.apply(Input::NavigationHint { target_id });
                }
                ContextCommand::Sync(event) => self.apply_sync(event),
                ContextCommand::StoreReply(store_reply) => self.handle_store_reply(store_reply),
            }
        }

        info!(
            component = "manager",
            event = "manager.stopped",
            identity = %self.state.self_id,
            "View context manager stopped"
        );
    }

    fn handle_switch(
        &mut self,
        target_id: String,
        reply: oneshot::Sender<Result<(), DelegationError>>,
    ) {
        if self.pending.is_some() {
            let _ = reply.send(Err(DelegationError::Conflict {
                reason: "another delegation operation is outstanding".to_string(),
            }));
            return;
        }

        let Some(target) = self
            .state
            .available_targets
            .iter()
            .find(|t| t.target_id == target_id)
            .cloned()
        else {
            let _ = reply.send(Err(DelegationError::Authorization { target_id }));
            return;
        };

        // Shutting down: the queue is already closing
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            let _ = reply.send(Err(DelegationError::transport(
                "view context manager is shutting down",
            )));
            return;
        };

        // The session being left behind, if the client is already delegated
        let previous_session = derive_context(&self.state)
            .viewing
            .and_then(|v| v.session_id);

        self.pending = Some(reply);
        self.apply(Input::BeginSwitch {
            target_id: target.target_id.clone(),
            target_label: target.label.clone(),
        });

        let store = self.store.clone();
        let self_id = self.state.self_id.clone();
        tokio::spawn(async move {
            // Leaving one mentee for another ends the old session first so
            // the mentor never holds two live views
            if let Some(prev_id) = previous_session {
                match store.deactivate(&prev_id).await {
                    Ok(_) | Err(DelegationError::NotFound { .. }) => {}
                    Err(e) => {
                        let _ = cmd_tx
                            .send(ContextCommand::StoreReply(StoreReply::Switched(Err(e))))
                            .await;
                        return;
                    }
                }
            }
            let result = store.create_or_activate(&self_id, &target.target_id).await;
            let _ = cmd_tx
                .send(ContextCommand::StoreReply(StoreReply::Switched(result)))
                .await;
        });
    }

    fn handle_return(&mut self, reply: oneshot::Sender<Result<(), DelegationError>>) {
        if self.pending.is_some() {
            let _ = reply.send(Err(DelegationError::Conflict {
                reason: "another delegation operation is outstanding".to_string(),
            }));
            return;
        }

        let viewing = derive_context(&self.state).viewing;
        let Some(session_id) = viewing.and_then(|v| v.session_id) else {
            // Already on the own account
            let _ = reply.send(Ok(()));
            return;
        };

        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            let _ = reply.send(Err(DelegationError::transport(
                "view context manager is shutting down",
            )));
            return;
        };

        self.pending = Some(reply);
        self.apply(Input::BeginExit);

        let store = self.store.clone();
        tokio::spawn(async move {
            let result = match store.deactivate(&session_id).await {
                Ok(session) => Ok(Some(session)),
                // Already gone: the end state is identical
                Err(DelegationError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            };
            let _ = cmd_tx
                .send(ContextCommand::StoreReply(StoreReply::Exited {
                    session_id,
                    result,
                }))
                .await;
        });
    }

    fn handle_store_reply(&mut self, store_reply: StoreReply) {
        let Some(reply) = self.pending.take() else {
            warn!(
                component = "manager",
                event = "manager.store_reply.orphaned",
                "Store reply arrived with no outstanding operation"
            );
            return;
        };

        match store_reply {
            StoreReply::Switched(Ok(session)) => {
                debug!(
                    component = "manager",
                    event = "manager.switch.confirmed",
                    session_id = %session.id,
                    target_id = %session.mentee_id,
                    "Switch confirmed by store"
                );
                self.apply(Input::Confirmed {
                    session: Some(session),
                });
                let _ = reply.send(Ok(()));
            }
            StoreReply::Switched(Err(error)) => {
                warn!(
                    component = "manager",
                    event = "manager.switch.rejected",
                    error = %error,
                    "Switch rejected by store, rolling back"
                );
                self.apply(Input::Rejected {
                    error: error.clone(),
                });
                let _ = reply.send(Err(error));
            }
            StoreReply::Exited { result: Ok(session), session_id } => {
                let session = session.or_else(|| {
                    // NotFound: the row is gone on the store side, flip our
                    // local copy so the derived context drops it too
                    self.state.sessions.get(&session_id).cloned().map(|mut s| {
                        s.is_active = false;
                        s
                    })
                });
                self.apply(Input::Confirmed { session });
                let _ = reply.send(Ok(()));
            }
            StoreReply::Exited { result: Err(error), .. } => {
                warn!(
                    component = "manager",
                    event = "manager.exit.rejected",
                    error = %error,
                    "Exit rejected by store, rolling back"
                );
                self.apply(Input::Rejected {
                    error: error.clone(),
                });
                let _ = reply.send(Err(error));
            }
        }
    }

    fn apply_sync(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Changed(change) => self.apply(Input::Changed(change)),
            SyncEvent::Reconciled { sessions, targets } => {
                self.apply(Input::Reconciled { sessions, targets })
            }
            SyncEvent::Disconnected => self.apply(Input::Disconnected),
        }
    }

    /// Fold one input through the reducer and publish the derived context
    fn apply(&mut self, input: Input) {
        let previous = self.snapshot.load_full();
        let (state, effects) = transition(self.state.clone(), input);
        self.state = state;

        let next = Arc::new(derive_context(&self.state));
        self.snapshot.store(next.clone());
        let _ = self.updates_tx.send(next.clone());
        self.notifier.on_transition(&previous, &next);

        for effect in effects {
            match effect {
                Effect::SurfaceError(error) => self.notifier.operation_failed(&error),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
