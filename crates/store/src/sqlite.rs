//! SQLite store backend
//!
//! Durable sessions with audit-trail retention: ended rows are kept, never
//! deleted. A partial unique index enforces the one-active-session-per-mentee
//! invariant at the schema level. SQLite access runs in `spawn_blocking`,
//! one command at a time, on a task that owns the change channel.

use std::path::{Path, PathBuf};

use mentorview_protocol::{
    new_id, now_millis, ChangeKind, DelegationError, DelegationSession, EligibleTarget,
};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::{create_store_channel, ChangeNotice, StoreCommand, StoreHandle, CHANGE_CHANNEL_CAPACITY};

pub struct SqliteStore {
    db_path: PathBuf,
    change_tx: broadcast::Sender<ChangeNotice>,
}

impl SqliteStore {
    /// Initialize the schema and spawn the backend task
    pub async fn spawn(db_path: impl AsRef<Path>) -> anyhow::Result<StoreHandle> {
        let db_path = db_path.as_ref().to_path_buf();
        {
            let db_path = db_path.clone();
            tokio::task::spawn_blocking(move || init_db(&db_path)).await??;
        }

        let (command_tx, command_rx) = create_store_channel();
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = SqliteStore { db_path, change_tx };
        tokio::spawn(store.run(command_rx));
        Ok(StoreHandle::new(command_tx))
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<StoreCommand>) {
        info!(
            component = "store",
            event = "store.sqlite.started",
            db = %self.db_path.display(),
            "SQLite store started"
        );
        while let Some(cmd) = command_rx.recv().await {
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::CreateOrActivate {
                mentor_id,
                mentee_id,
                reply,
            } => {
                let result = self
                    .blocking(move |conn| create_or_activate(conn, &mentor_id, &mentee_id))
                    .await;
                if let Ok((ref session, created)) = result {
                    if created {
                        let _ = self.change_tx.send((ChangeKind::Created, session.clone()));
                    }
                }
                let _ = reply.send(result.map(|(session, _)| session));
            }

            StoreCommand::Deactivate { session_id, reply } => {
                let result = self
                    .blocking(move |conn| deactivate(conn, &session_id))
                    .await;
                if let Ok(ref session) = result {
                    let _ = self
                        .change_tx
                        .send((ChangeKind::Deactivated, session.clone()));
                }
                let _ = reply.send(result);
            }

            StoreCommand::ListActiveFor { identity, reply } => {
                // Read failures must reach the caller: an error is not an
                // empty session set
                let result = self
                    .blocking(move |conn| list_active_for(conn, &identity))
                    .await;
                let _ = reply.send(result);
            }

            StoreCommand::ListEligibleFor { identity, reply } => {
                let result = self
                    .blocking(move |conn| list_eligible_for(conn, &identity))
                    .await;
                let _ = reply.send(result);
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
                let result = self
                    .blocking(move |conn| {
                        conn.execute(
                            "INSERT INTO delegation_grants (mentor_id, mentee_id, label)
                             VALUES (?1, ?2, ?3)
                             ON CONFLICT(mentor_id, mentee_id) DO UPDATE SET label = ?3",
                            params![mentor_id, mentee_id, label],
                        )
                        .map(|_| ())
                        .map_err(transport)
                    })
                    .await;
                let _ = reply.send(result);
            }

            StoreCommand::Revoke {
                mentor_id,
                mentee_id,
                reply,
            } => {
                let result = self
                    .blocking(move |conn| {
                        conn.execute(
                            "DELETE FROM delegation_grants WHERE mentor_id = ?1 AND mentee_id = ?2",
                            params![mentor_id, mentee_id],
                        )
                        .map(|_| ())
                        .map_err(transport)
                    })
                    .await;
                let _ = reply.send(result);
            }

            StoreCommand::ResetChangeChannel { reply } => {
                let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
                self.change_tx = change_tx;
                info!(
                    component = "store",
                    event = "store.sqlite.change_channel_reset",
                    "Change channel reset, subscribers dropped"
                );
                let _ = reply.send(());
            }
        }
    }

    /// Run a closure against a fresh connection on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T, DelegationError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DelegationError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            f(&conn)
        })
        .await;
        match joined {
            Ok(result) => result,
            Err(e) => {
                error!(
                    component = "store",
                    event = "store.sqlite.task_panicked",
                    error = %e,
                    "SQLite task panicked"
                );
                Err(DelegationError::transport("store worker panicked"))
            }
        }
    }
}

fn transport(e: rusqlite::Error) -> DelegationError {
    DelegationError::Transport(e.to_string())
}

fn open_connection(db_path: &Path) -> Result<Connection, DelegationError> {
    let conn = Connection::open(db_path).map_err(transport)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(transport)?;
    Ok(conn)
}

fn init_db(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;

         CREATE TABLE IF NOT EXISTS delegation_sessions (
             id TEXT PRIMARY KEY,
             mentor_id TEXT NOT NULL,
             mentee_id TEXT NOT NULL,
             mentor_label TEXT,
             mentee_label TEXT,
             is_active INTEGER NOT NULL DEFAULT 1,
             started_at INTEGER NOT NULL,
             ended_at INTEGER
         );

         CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_per_mentee
             ON delegation_sessions (mentee_id) WHERE is_active = 1;

         CREATE INDEX IF NOT EXISTS idx_sessions_mentor
             ON delegation_sessions (mentor_id);

         CREATE TABLE IF NOT EXISTS delegation_grants (
             mentor_id TEXT NOT NULL,
             mentee_id TEXT NOT NULL,
             label TEXT,
             PRIMARY KEY (mentor_id, mentee_id)
         );",
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<DelegationSession> {
    Ok(DelegationSession {
        id: row.get(0)?,
        mentor_id: row.get(1)?,
        mentee_id: row.get(2)?,
        mentor_label: row.get(3)?,
        mentee_label: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        started_at: row.get::<_, i64>(6)? as u64,
        ended_at: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
    })
}

const SESSION_COLUMNS: &str =
    "id, mentor_id, mentee_id, mentor_label, mentee_label, is_active, started_at, ended_at";

/// Returns the session and whether a new row was created
fn create_or_activate(
    conn: &Connection,
    mentor_id: &str,
    mentee_id: &str,
) -> Result<(DelegationSession, bool), DelegationError> {
    let grant_label: Option<Option<String>> = conn
        .query_row(
            "SELECT label FROM delegation_grants WHERE mentor_id = ?1 AND mentee_id = ?2",
            params![mentor_id, mentee_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(transport)?;
    let Some(mentee_label) = grant_label else {
        return Err(DelegationError::Authorization {
            target_id: mentee_id.to_string(),
        });
    };

    let existing = conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM delegation_sessions
                 WHERE mentee_id = ?1 AND is_active = 1"
            ),
            params![mentee_id],
            row_to_session,
        )
        .optional()
        .map_err(transport)?;
    if let Some(active) = existing {
        if active.mentor_id == mentor_id {
            return Ok((active, false));
        }
        return Err(DelegationError::Conflict {
            reason: format!("{} already has an active viewer", mentee_id),
        });
    }

    let session = DelegationSession {
        id: new_id(),
        mentor_id: mentor_id.to_string(),
        mentee_id: mentee_id.to_string(),
        mentor_label: None,
        mentee_label,
        is_active: true,
        started_at: now_millis(),
        ended_at: None,
    };
    let inserted = conn.execute(
        "INSERT INTO delegation_sessions
             (id, mentor_id, mentee_id, mentor_label, mentee_label, is_active, started_at, ended_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, NULL)",
        params![
            session.id,
            session.mentor_id,
            session.mentee_id,
            session.mentor_label,
            session.mentee_label,
            session.started_at as i64,
        ],
    );
    match inserted {
        Ok(_) => {
            debug!(
                component = "store",
                event = "store.session.created",
                session_id = %session.id,
                mentee_id = %session.mentee_id,
                "Delegation session created"
            );
            Ok((session, true))
        }
        // The partial unique index caught a writer that slipped in between
        // the check and the insert
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(DelegationError::Conflict {
                reason: format!("{} already has an active viewer", mentee_id),
            })
        }
        Err(e) => Err(transport(e)),
    }
}

fn deactivate(conn: &Connection, session_id: &str) -> Result<DelegationSession, DelegationError> {
    let ended_at = now_millis();
    let updated = conn
        .execute(
            "UPDATE delegation_sessions SET is_active = 0, ended_at = ?2
             WHERE id = ?1 AND is_active = 1",
            params![session_id, ended_at as i64],
        )
        .map_err(transport)?;
    if updated == 0 {
        return Err(DelegationError::NotFound {
            session_id: session_id.to_string(),
        });
    }
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM delegation_sessions WHERE id = ?1"),
        params![session_id],
        row_to_session,
    )
    .map_err(transport)
}

fn list_active_for(
    conn: &Connection,
    identity: &str,
) -> Result<Vec<DelegationSession>, DelegationError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM delegation_sessions
             WHERE is_active = 1 AND (mentor_id = ?1 OR mentee_id = ?1)
             ORDER BY started_at"
        ))
        .map_err(transport)?;
    let rows = stmt
        .query_map(params![identity], row_to_session)
        .map_err(transport)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(transport)
}

fn list_eligible_for(
    conn: &Connection,
    identity: &str,
) -> Result<Vec<EligibleTarget>, DelegationError> {
    let mut stmt = conn
        .prepare(
            "SELECT mentee_id, label FROM delegation_grants
             WHERE mentor_id = ?1 ORDER BY mentee_id",
        )
        .map_err(transport)?;
    let rows = stmt
        .query_map(params![identity], |row| {
            Ok(EligibleTarget {
                target_id: row.get(0)?,
                label: row.get(1)?,
            })
        })
        .map_err(transport)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, StoreHandle) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::spawn(dir.path().join("mentorview.db"))
            .await
            .unwrap();
        store.grant("mentor-m", "mentee-e", Some("Elena")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn sessions_survive_in_audit_trail() {
        let (_dir, store) = temp_store().await;
        let session = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        assert_eq!(session.mentee_label.as_deref(), Some("Elena"));

        store.deactivate(&session.id).await.unwrap();
        assert!(store.list_active_for("mentee-e").await.unwrap().is_empty());

        // A new session for the same pair gets a fresh row
        let next = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        assert_ne!(next.id, session.id);
    }

    #[tokio::test]
    async fn unique_index_rejects_second_viewer() {
        let (_dir, store) = temp_store().await;
        store.grant("mentor-other", "mentee-e", None).await.unwrap();

        store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        let err = store
            .create_or_activate("mentor-other", "mentee-e")
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::Conflict { .. }));
    }

    #[tokio::test]
    async fn ungrant_blocks_future_sessions() {
        let (_dir, store) = temp_store().await;
        store.revoke("mentor-m", "mentee-e").await.unwrap();
        let err = store.create_or_activate("mentor-m", "mentee-e").await.unwrap_err();
        assert!(matches!(err, DelegationError::Authorization { .. }));
    }

    #[tokio::test]
    async fn deactivate_missing_session_is_not_found() {
        let (_dir, store) = temp_store().await;
        let err = store.deactivate("no-such-session").await.unwrap_err();
        assert!(matches!(err, DelegationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn read_failure_surfaces_as_transport_error_not_empty_set() {
        let (dir, store) = temp_store().await;
        store.create_or_activate("mentor-m", "mentee-e").await.unwrap();

        // Database gone mid-run: reads must fail loudly, never report an
        // authoritative empty session set
        std::fs::remove_dir_all(dir.path()).unwrap();

        let err = store.list_active_for("mentee-e").await.unwrap_err();
        assert!(matches!(err, DelegationError::Transport(_)));
        let err = store.list_eligible_for("mentor-m").await.unwrap_err();
        assert!(matches!(err, DelegationError::Transport(_)));
    }

    #[tokio::test]
    async fn change_events_flow_from_sqlite_backend() {
        let (_dir, store) = temp_store().await;
        let mut rx = store.subscribe_changes().await.unwrap();

        let session = store.create_or_activate("mentor-m", "mentee-e").await.unwrap();
        let (kind, snapshot) = rx.recv().await.unwrap();
        assert_eq!(kind, ChangeKind::Created);
        assert_eq!(snapshot.id, session.id);
    }
}
