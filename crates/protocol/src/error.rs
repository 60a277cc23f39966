//! Error taxonomy for delegation operations

use thiserror::Error;

/// Errors that can occur while switching, exiting, or talking to the
/// session store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    /// Target is not delegation-eligible. Fatal to the requested switch;
    /// surfaced to the user, never retried.
    #[error("not authorized to view {target_id}")]
    Authorization { target_id: String },

    /// A session for this mentee is already active, or another local
    /// operation is still outstanding. Surfaced, not retried automatically.
    #[error("conflicting delegation operation: {reason}")]
    Conflict { reason: String },

    /// Deactivating a session that is already gone. Callers treat this as
    /// success since the end state is identical.
    #[error("session {session_id} not found")]
    NotFound { session_id: String },

    /// Store connection trouble. Recovered internally by the synchronizer;
    /// visible to local operations only when their round trip is cut off.
    #[error("session store unreachable: {0}")]
    Transport(String),
}

impl DelegationError {
    pub fn transport(msg: impl Into<String>) -> Self {
        DelegationError::Transport(msg.into())
    }
}
