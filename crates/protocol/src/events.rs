//! Change events re-emitted by the session synchronizer

use serde::{Deserialize, Serialize};

use crate::types::DelegationSession;

/// What happened to a session row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Activated,
    Deactivated,
}

/// One relevant row change, carrying the full session snapshot.
/// Consumers merge the snapshot rather than interpreting the kind, so a
/// replayed or re-ordered event can never corrupt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChangeEvent {
    pub kind: ChangeKind,
    pub session: DelegationSession,
}
