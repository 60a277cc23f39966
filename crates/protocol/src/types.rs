//! Core types shared across the subsystem

use serde::{Deserialize, Serialize};

/// One mentor viewing one mentee. Rows are never deleted; deactivation
/// flips `is_active` and stamps `ended_at` exactly once (audit trail).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationSession {
    pub id: String,
    pub mentor_id: String,
    pub mentee_id: String,
    pub mentor_label: Option<String>,
    pub mentee_label: Option<String>,
    pub is_active: bool,
    /// Unix millis at creation
    pub started_at: u64,
    /// Unix millis, set once on deactivation
    pub ended_at: Option<u64>,
}

impl DelegationSession {
    /// Whether this session is relevant to the given identity
    pub fn involves(&self, identity: &str) -> bool {
        self.mentor_id == identity || self.mentee_id == identity
    }
}

/// A delegation-eligible identity the current user may switch into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleTarget {
    pub target_id: String,
    pub label: Option<String>,
}

/// Which account the client is looking at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    Own,
    DelegatedViewer,
}

/// An active delegation where the current user is the mentee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerInfo {
    pub session_id: String,
    pub mentor_id: String,
    pub mentor_label: Option<String>,
}

/// The identity currently being viewed (present only while delegated)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewTarget {
    /// None while the switch is optimistic and unconfirmed by the store
    pub session_id: Option<String>,
    pub target_id: String,
    pub target_label: Option<String>,
    pub optimistic: bool,
}

/// Per-client projection of the delegation state. Always a pure function
/// of the latest known session set plus `self_id`; holds no persisted
/// state of its own.
///
/// `viewing` (viewer role) and `viewed_by` (subject role) are independent:
/// a user can be inspected by their mentor while themselves inspecting a
/// different mentee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewContext {
    pub self_id: String,
    pub viewing: Option<ViewTarget>,
    /// Active delegations where `self_id` is the mentee
    pub viewed_by: Vec<ViewerInfo>,
    pub available_targets: Vec<EligibleTarget>,
    /// False until the first authoritative reconciliation, and again
    /// while the change channel is down. Mutations are blocked while false.
    pub reconciled: bool,
    pub revision: u64,
}

impl ViewContext {
    /// Initial context before any authoritative state is known
    pub fn initial(self_id: String) -> Self {
        Self {
            self_id,
            viewing: None,
            viewed_by: Vec::new(),
            available_targets: Vec::new(),
            reconciled: false,
            revision: 0,
        }
    }

    pub fn mode(&self) -> ViewMode {
        if self.viewing.is_some() {
            ViewMode::DelegatedViewer
        } else {
            ViewMode::Own
        }
    }

    /// Whether some mentor currently has a view into this account
    pub fn is_viewed(&self) -> bool {
        !self.viewed_by.is_empty()
    }

    pub fn is_eligible_target(&self, target_id: &str) -> bool {
        self.available_targets.iter().any(|t| t.target_id == target_id)
    }
}

/// What a user-visible alert is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// "You are viewing X" — shown to the mentor
    Viewing {
        target_id: String,
        target_label: Option<String>,
    },
    /// "Your account is being viewed" — shown to the mentee
    BeingViewed {
        mentor_id: String,
        mentor_label: Option<String>,
    },
}

/// Events surfaced to the UI layer for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Show an alert; persists until the matching `Dismiss`
    Show {
        session_id: String,
        kind: NotificationKind,
    },
    /// Dismiss exactly the alert keyed by this session
    Dismiss { session_id: String },
    /// A mutation was attempted and refused while in read-only mode
    ReadOnlyDenied,
    /// A switch or exit was rejected by the store and rolled back
    OperationFailed { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(mentor: &str, mentee: &str) -> DelegationSession {
        DelegationSession {
            id: "s-1".to_string(),
            mentor_id: mentor.to_string(),
            mentee_id: mentee.to_string(),
            mentor_label: None,
            mentee_label: None,
            is_active: true,
            started_at: 1_000,
            ended_at: None,
        }
    }

    #[test]
    fn session_involves_both_parties() {
        let s = session("mentor-a", "mentee-b");
        assert!(s.involves("mentor-a"));
        assert!(s.involves("mentee-b"));
        assert!(!s.involves("stranger"));
    }

    #[test]
    fn initial_context_is_own_and_unreconciled() {
        let ctx = ViewContext::initial("me".to_string());
        assert_eq!(ctx.mode(), ViewMode::Own);
        assert!(!ctx.reconciled);
        assert!(!ctx.is_viewed());
    }

    #[test]
    fn context_with_viewing_is_delegated_viewer() {
        let mut ctx = ViewContext::initial("me".to_string());
        ctx.viewing = Some(ViewTarget {
            session_id: Some("s-1".to_string()),
            target_id: "other".to_string(),
            target_label: None,
            optimistic: false,
        });
        assert_eq!(ctx.mode(), ViewMode::DelegatedViewer);
    }

    #[test]
    fn notification_event_serializes_tagged() {
        let event = NotificationEvent::Dismiss {
            session_id: "s-1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"dismiss\""));
    }
}
