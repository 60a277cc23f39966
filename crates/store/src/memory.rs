//! In-memory store backend
//!
//! Owns all rows in a HashMap on a single task. Used by tests and demos;
//! behaviorally identical to the SQLite backend, including the change
//! channel and the uniqueness invariant.

use std::collections::HashMap;

use mentorview_protocol::{
    new_id, now_millis, ChangeKind, DelegationError, DelegationSession, EligibleTarget,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::{create_store_channel, ChangeNotice, StoreCommand, StoreHandle, CHANGE_CHANNEL_CAPACITY};

#[derive(Debug, Clone)]
struct Grant {
    mentor_id: String,
    mentee_id: String,
    label: Option<String>,
}

pub struct MemoryStore {
    sessions: HashMap<String, DelegationSession>,
    grants: Vec<Grant>,
    change_tx: broadcast::Sender<ChangeNotice>,
}

impl MemoryStore {
    /// Spawn the backend task, returning a handle
    pub fn spawn() -> StoreHandle {
        let (command_tx, command_rx) = create_store_channel();
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = MemoryStore {
            sessions: HashMap::new(),
            grants: Vec::new(),
            change_tx,
        };
        tokio::spawn(store.run(command_rx));
        StoreHandle::new(command_tx)
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<StoreCommand>) {
        info!(component = "store", event = "store.memory.started", "Memory store started");
        while let Some(cmd) = command_rx.recv().await {
            self.handle(cmd);
        }
        debug!(component = "store", event = "store.memory.stopped", "Memory store stopped");
    }

    fn handle(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::CreateOrActivate {
                mentor_id,
                mentee_id,
                reply,
            } => {
                let _ = reply.send(self.create_or_activate(mentor_id, mentee_id));
            }

            StoreCommand::Deactivate { session_id, reply } => {
                let _ = reply.send(self.deactivate(session_id));
            }

            StoreCommand::ListActiveFor { identity, reply } => {
                let mut sessions: Vec<DelegationSession> = self
                    .sessions
                    .values()
                    .filter(|s| s.is_active && s.involves(&identity))
                    .cloned()
                    .collect();
                sessions.sort_by_key(|s| s.started_at);
                let _ = reply.send(Ok(sessions));
            }

            StoreCommand::ListEligibleFor { identity, reply } => {
                let targets = self
                    .grants
                    .iter()
                    .filter(|g| g.mentor_id == identity)
                    .map(|g| EligibleTarget {
                        target_id: g.mentee_id.clone(),
                        label: g.label.clone(),
                    })
                    .collect();
                let _ = reply.send(Ok(targets));
            }

            StoreCommand::Subscribe { reply } => {
                let _ = reply.send(self.change_tx.subscribe());
            }

            StoreCommand::Grant {
                mentor_id,
                mentee_id,
                label,
                reply,
            } => {
                self.grants
                    .retain(|g| !(g.mentor_id == mentor_id && g.mentee_id == mentee_id));
                self.grants.push(Grant {
                    mentor_id,
                    mentee_id,
                    label,
                });
                let _ = reply.send(Ok(()));
            }

            StoreCommand::Revoke {
                mentor_id,
                mentee_id,
                reply,
            } => {
                self.grants
                    .retain(|g| !(g.mentor_id == mentor_id && g.mentee_id == mentee_id));
                let _ = reply.send(Ok(()));
            }

            StoreCommand::ResetChangeChannel { reply } => {
                // Replacing the sender closes every outstanding receiver
                let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
                self.change_tx = change_tx;
                info!(
                    component = "store",
                    event = "store.memory.change_channel_reset",
                    "Change channel reset, subscribers dropped"
                );
                let _ = reply.send(());
            }
        }
    }

    fn create_or_activate(
        &mut self,
        mentor_id: String,
        mentee_id: String,
    ) -> Result<DelegationSession, DelegationError> {
        let grant = self
            .grants
            .iter()
            .find(|g| g.mentor_id == mentor_id && g.mentee_id == mentee_id)
            .cloned()
            .ok_or(DelegationError::Authorization {
                target_id: mentee_id.clone(),
            })?;

        if let Some(active) = self
            .sessions
            .values()
            .find(|s| s.is_active && s.mentee_id == mentee_id)
        {
            if active.mentor_id == mentor_id {
                // Idempotent re-activation of the same pair
                return Ok(active.clone());
            }
            return Err(DelegationError::Conflict {
                reason: format!("{} already has an active viewer", mentee_id),
            });
        }

        let session = DelegationSession {
            id: new_id(),
            mentor_id,
            mentee_id,
            mentor_label: None,
            mentee_label: grant.label,
            is_active: true,
            started_at: now_millis(),
            ended_at: None,
        };
        self.sessions.insert(session.id.clone(), session.clone());
        debug!(
            component = "store",
            event = "store.session.created",
            session_id = %session.id,
            mentee_id = %session.mentee_id,
            "Delegation session created"
        );
        let _ = self.change_tx.send((ChangeKind::Created, session.clone()));
        Ok(session)
    }

    fn deactivate(&mut self, session_id: String) -> Result<DelegationSession, DelegationError> {
        match self.sessions.get_mut(&session_id) {
            Some(session) if session.is_active => {
                session.is_active = false;
                session.ended_at = Some(now_millis());
                let snapshot = session.clone();
                debug!(
                    component = "store",
                    event = "store.session.deactivated",
                    session_id = %snapshot.id,
                    "Delegation session deactivated"
                );
                let _ = self.change_tx.send((ChangeKind::Deactivated, snapshot.clone()));
                Ok(snapshot)
            }
            // Already ended or never existed: the end state is identical
            _ => Err(DelegationError::NotFound { session_id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_grant() -> StoreHandle {
        let store = MemoryStore::spawn();
        store.grant("mentor-m", "mentee-e", Some("Elena")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_requires_grant() {
        let store = MemoryStore::spawn();
        let err = store.create_or_activate("mentor-m", "mentee-e").await.unwrap_err();
        assert!(matches!(err, DelegationError::Authorization { .. }));
    }

    #[tokio::test]
    async fn at_most_one_active_session_per_mentee() {
        let store = store_with_grant().await;
        store.grant("mentor-other", "mentee-e", None).await.unwrap();

        store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        let err = store
            .create_or_activate("mentor-other", "mentee-e")
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::Conflict { .. }));

        let active = store.list_active_for("mentee-e").await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn create_or_activate_is_idempotent_for_same_pair() {
        let store = store_with_grant().await;
        let first = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        let second = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn deactivate_stamps_ended_at_once() {
        let store = store_with_grant().await;
        let session = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();

        let ended = store.deactivate(&session.id).await.unwrap();
        assert!(!ended.is_active);
        assert!(ended.ended_at.is_some());

        let err = store.deactivate(&session.id).await.unwrap_err();
        assert!(matches!(err, DelegationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn changes_are_broadcast_to_subscribers() {
        let store = store_with_grant().await;
        let mut rx = store.subscribe_changes().await.unwrap();

        let session = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        let (kind, snapshot) = rx.recv().await.unwrap();
        assert_eq!(kind, ChangeKind::Created);
        assert_eq!(snapshot.id, session.id);

        store.deactivate(&session.id).await.unwrap();
        let (kind, snapshot) = rx.recv().await.unwrap();
        assert_eq!(kind, ChangeKind::Deactivated);
        assert!(!snapshot.is_active);
    }

    #[tokio::test]
    async fn reset_closes_existing_subscribers() {
        let store = store_with_grant().await;
        let mut rx = store.subscribe_changes().await.unwrap();
        store.reset_change_channel().await.unwrap();

        match rx.recv().await {
            Err(broadcast::error::RecvError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }

        // A fresh subscription sees new events again
        let mut rx = store.subscribe_changes().await.unwrap();
        store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn revoke_removes_eligibility_but_not_running_sessions() {
        let store = store_with_grant().await;
        let session = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();

        store.revoke("mentor-m", "mentee-e").await.unwrap();
        assert!(store.list_eligible_for("mentor-m").await.unwrap().is_empty());

        let active = store.list_active_for("mentor-m").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, session.id);
    }
}
