//! Pure state transition function
//!
//! All business logic for delegation state changes lives here as a pure,
//! synchronous function: `transition(state, input) -> (state, effects)`.
//! No IO, no async, no locking — fully unit-testable. The derived
//! `ViewContext` is always a pure projection of the latest known session
//! set plus `self_id` plus the optimistic overlay.

use std::collections::HashMap;

use mentorview_protocol::{
    DelegationError, DelegationSession, EligibleTarget, SessionChangeEvent, ViewContext,
    ViewTarget, ViewerInfo,
};

/// Ended sessions kept as tombstones so a stale active snapshot replayed
/// after reconciliation can never resurrect them
const MAX_TOMBSTONES: usize = 256;

// ---------------------------------------------------------------------------
// ContextState — the authoritative per-client state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextState {
    pub self_id: String,
    /// Latest known snapshot per session id, tombstones included
    pub sessions: HashMap<String, DelegationSession>,
    pub available_targets: Vec<EligibleTarget>,
    /// False until the first authoritative reconciliation, and again
    /// while the change channel is down
    pub reconciled: bool,
    /// Local operation applied ahead of store confirmation
    pub optimistic: Option<OptimisticOp>,
    /// Target identity recovered from navigation state. Only honored by
    /// selecting among store-confirmed active sessions.
    pub nav_hint: Option<String>,
    pub revision: u64,
}

impl ContextState {
    pub fn new(self_id: String) -> Self {
        Self {
            self_id,
            sessions: HashMap::new(),
            available_targets: Vec::new(),
            reconciled: false,
            optimistic: None,
            nav_hint: None,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticOp {
    /// `switch_to_target` requested, store round trip outstanding
    Switch {
        target_id: String,
        target_label: Option<String>,
    },
    /// `return_to_own` requested, store round trip outstanding
    Exit,
}

// ---------------------------------------------------------------------------
// Input — one variant per event the manager can fold in
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    /// One row change from the synchronizer
    Changed(SessionChangeEvent),
    /// Full authoritative refetch after (re)connecting
    Reconciled {
        sessions: Vec<DelegationSession>,
        targets: Vec<EligibleTarget>,
    },
    /// Change channel lost; state is stale until the next `Reconciled`
    Disconnected,
    /// Local switch applied optimistically before confirmation
    BeginSwitch {
        target_id: String,
        target_label: Option<String>,
    },
    /// Local exit applied optimistically before confirmation
    BeginExit,
    /// Store confirmed the outstanding operation
    Confirmed { session: Option<DelegationSession> },
    /// Store rejected the outstanding operation; roll back to the last
    /// authoritative state
    Rejected { error: DelegationError },
    /// Delegated target recovered from navigation state on load
    NavigationHint { target_id: String },
}

/// IO to be executed by the caller
#[derive(Debug, Clone)]
pub enum Effect {
    SurfaceError(DelegationError),
}

// ---------------------------------------------------------------------------
// transition() — the pure core
// ---------------------------------------------------------------------------

pub fn transition(mut state: ContextState, input: Input) -> (ContextState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        Input::Changed(event) => {
            merge_session(&mut state.sessions, event.session);
        }

        Input::Reconciled { sessions, targets } => {
            // Keep tombstones: a session we know as ended must stay ended
            // even though the active-set refetch no longer lists it.
            let mut next: HashMap<String, DelegationSession> = state
                .sessions
                .iter()
                .filter(|(_, s)| !s.is_active)
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect();

            // Sessions we knew as active but the store no longer lists
            // ended while we were not looking.
            for (id, known) in &state.sessions {
                if known.is_active && !sessions.iter().any(|s| &s.id == id) {
                    let mut ended = known.clone();
                    ended.is_active = false;
                    next.insert(id.clone(), ended);
                }
            }

            for session in sessions {
                merge_session(&mut next, session);
            }
            prune_tombstones(&mut next);

            state.sessions = next;
            state.available_targets = targets;
            state.reconciled = true;
        }

        Input::Disconnected => {
            state.reconciled = false;
        }

        Input::BeginSwitch {
            target_id,
            target_label,
        } => {
            state.optimistic = Some(OptimisticOp::Switch {
                target_id,
                target_label,
            });
        }

        Input::BeginExit => {
            state.optimistic = Some(OptimisticOp::Exit);
        }

        Input::Confirmed { session } => {
            if let Some(session) = session {
                if session.is_active {
                    // Pin the view to the confirmed mentee so a second
                    // active session elsewhere cannot shadow it
                    state.nav_hint = Some(session.mentee_id.clone());
                } else {
                    state.nav_hint = None;
                }
                merge_session(&mut state.sessions, session);
            } else {
                state.nav_hint = None;
            }
            state.optimistic = None;
        }

        Input::Rejected { error } => {
            // Dropping the overlay restores exactly the last authoritative
            // context, since everything else derives from the session set
            state.optimistic = None;
            effects.push(Effect::SurfaceError(error));
        }

        Input::NavigationHint { target_id } => {
            state.nav_hint = Some(target_id);
        }
    }

    state.revision += 1;
    (state, effects)
}

/// Fold one session snapshot into the known set. Lifecycle order wins over
/// arrival order: a session is created active and deactivated exactly once,
/// so an inactive snapshot is always at least as new as an active one and a
/// stale `Activated` can never resurrect an ended session.
fn merge_session(sessions: &mut HashMap<String, DelegationSession>, incoming: DelegationSession) {
    match sessions.get(&incoming.id) {
        Some(existing) if !existing.is_active && incoming.is_active => {}
        _ => {
            sessions.insert(incoming.id.clone(), incoming);
        }
    }
}

fn prune_tombstones(sessions: &mut HashMap<String, DelegationSession>) {
    let inactive = sessions.values().filter(|s| !s.is_active).count();
    if inactive <= MAX_TOMBSTONES {
        return;
    }
    let mut ended: Vec<(String, u64)> = sessions
        .values()
        .filter(|s| !s.is_active)
        .map(|s| (s.id.clone(), s.ended_at.unwrap_or(s.started_at)))
        .collect();
    ended.sort_by_key(|(_, at)| *at);
    for (id, _) in ended.into_iter().take(inactive - MAX_TOMBSTONES) {
        sessions.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// derive_context() — project state into the consumer-facing snapshot
// ---------------------------------------------------------------------------

pub fn derive_context(state: &ContextState) -> ViewContext {
    let viewing = match &state.optimistic {
        Some(OptimisticOp::Switch {
            target_id,
            target_label,
        }) => Some(ViewTarget {
            session_id: None,
            target_id: target_id.clone(),
            target_label: target_label.clone(),
            optimistic: true,
        }),
        Some(OptimisticOp::Exit) => None,
        None => confirmed_viewing(state),
    };

    let mut viewed_by: Vec<ViewerInfo> = state
        .sessions
        .values()
        .filter(|s| s.is_active && s.mentee_id == state.self_id)
        .map(|s| ViewerInfo {
            session_id: s.id.clone(),
            mentor_id: s.mentor_id.clone(),
            mentor_label: s.mentor_label.clone(),
        })
        .collect();
    viewed_by.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    ViewContext {
        self_id: state.self_id.clone(),
        viewing,
        viewed_by,
        available_targets: state.available_targets.clone(),
        reconciled: state.reconciled,
        revision: state.revision,
    }
}

fn confirmed_viewing(state: &ContextState) -> Option<ViewTarget> {
    let mut candidates: Vec<&DelegationSession> = state
        .sessions
        .values()
        .filter(|s| s.is_active && s.mentor_id == state.self_id)
        .collect();
    candidates.sort_by_key(|s| s.started_at);

    let chosen = state
        .nav_hint
        .as_ref()
        .and_then(|hint| candidates.iter().find(|s| &s.mentee_id == hint).copied())
        .or_else(|| candidates.last().copied())?;

    Some(ViewTarget {
        session_id: Some(chosen.id.clone()),
        target_id: chosen.mentee_id.clone(),
        target_label: chosen.mentee_label.clone(),
        optimistic: false,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mentorview_protocol::{ChangeKind, ViewMode};

    const SELF: &str = "mentor-m";

    fn test_state() -> ContextState {
        let mut state = ContextState::new(SELF.to_string());
        state.reconciled = true;
        state.available_targets = vec![EligibleTarget {
            target_id: "mentee-e".to_string(),
            label: Some("Elena".to_string()),
        }];
        state
    }

    fn session(id: &str, mentor: &str, mentee: &str, started_at: u64) -> DelegationSession {
        DelegationSession {
            id: id.to_string(),
            mentor_id: mentor.to_string(),
            mentee_id: mentee.to_string(),
            mentor_label: None,
            mentee_label: None,
            is_active: true,
            started_at,
            ended_at: None,
        }
    }

    fn ended(mut s: DelegationSession, at: u64) -> DelegationSession {
        s.is_active = false;
        s.ended_at = Some(at);
        s
    }

    fn changed(kind: ChangeKind, session: DelegationSession) -> Input {
        Input::Changed(SessionChangeEvent { kind, session })
    }

    #[test]
    fn activated_session_becomes_delegated_viewer() {
        let state = test_state();
        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-1", SELF, "mentee-e", 1_000)),
        );

        let ctx = derive_context(&state);
        assert_eq!(ctx.mode(), ViewMode::DelegatedViewer);
        let viewing = ctx.viewing.unwrap();
        assert_eq!(viewing.target_id, "mentee-e");
        assert_eq!(viewing.session_id.as_deref(), Some("s-1"));
        assert!(!viewing.optimistic);
    }

    #[test]
    fn deactivated_event_forces_own_even_without_local_action() {
        let state = test_state();
        let s = session("s-1", SELF, "mentee-e", 1_000);
        let (state, _) = transition(state, changed(ChangeKind::Created, s.clone()));
        let (state, _) = transition(state, changed(ChangeKind::Deactivated, ended(s, 2_000)));

        let ctx = derive_context(&state);
        assert_eq!(ctx.mode(), ViewMode::Own);
    }

    #[test]
    fn duplicate_deactivated_is_idempotent() {
        let state = test_state();
        let s = session("s-1", SELF, "mentee-e", 1_000);
        let (state, _) = transition(state, changed(ChangeKind::Created, s.clone()));
        let (once, _) = transition(state, changed(ChangeKind::Deactivated, ended(s.clone(), 2_000)));
        let (twice, _) = transition(once.clone(), changed(ChangeKind::Deactivated, ended(s, 2_000)));

        // Revision advances per applied input; the projection is
        // otherwise identical
        let mut a = derive_context(&once);
        let mut b = derive_context(&twice);
        a.revision = 0;
        b.revision = 0;
        assert_eq!(a, b);
    }

    #[test]
    fn out_of_order_delivery_converges_to_own() {
        let state = test_state();
        let s = session("s-1", SELF, "mentee-e", 1_000);

        // Deactivated(t2) arrives before Activated(t1)
        let (state, _) = transition(state, changed(ChangeKind::Deactivated, ended(s.clone(), 2_000)));
        let (state, _) = transition(state, changed(ChangeKind::Activated, s));

        let ctx = derive_context(&state);
        assert_eq!(ctx.mode(), ViewMode::Own, "stale Activated must not resurrect");
    }

    #[test]
    fn subject_role_is_tracked_independently() {
        let mut state = test_state();
        state.self_id = "mentee-e".to_string();

        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-1", SELF, "mentee-e", 1_000)),
        );
        let ctx = derive_context(&state);
        assert_eq!(ctx.mode(), ViewMode::Own);
        assert!(ctx.is_viewed());
        assert_eq!(ctx.viewed_by[0].mentor_id, SELF);
    }

    #[test]
    fn viewer_and_subject_can_coexist() {
        let state = test_state();
        // I view mentee-e while mentor-x views me
        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-1", SELF, "mentee-e", 1_000)),
        );
        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-2", "mentor-x", SELF, 1_100)),
        );

        let ctx = derive_context(&state);
        assert_eq!(ctx.mode(), ViewMode::DelegatedViewer);
        assert!(ctx.is_viewed());
    }

    #[test]
    fn optimistic_switch_shows_target_before_confirmation() {
        let state = test_state();
        let (state, _) = transition(
            state,
            Input::BeginSwitch {
                target_id: "mentee-e".to_string(),
                target_label: Some("Elena".to_string()),
            },
        );

        let ctx = derive_context(&state);
        let viewing = ctx.viewing.unwrap();
        assert!(viewing.optimistic);
        assert!(viewing.session_id.is_none());
        assert_eq!(viewing.target_id, "mentee-e");
    }

    #[test]
    fn rejected_switch_rolls_back_to_authoritative_context() {
        let state = test_state();
        let before = derive_context(&state);

        let (state, _) = transition(
            state,
            Input::BeginSwitch {
                target_id: "mentee-e".to_string(),
                target_label: None,
            },
        );
        let (state, effects) = transition(
            state,
            Input::Rejected {
                error: DelegationError::Conflict {
                    reason: "taken".to_string(),
                },
            },
        );

        let mut after = derive_context(&state);
        after.revision = before.revision;
        assert_eq!(after, before);
        assert!(matches!(effects[0], Effect::SurfaceError(_)));
    }

    #[test]
    fn confirmed_switch_pins_the_confirmed_target() {
        let state = test_state();
        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-old", SELF, "mentee-other", 900)),
        );
        let (state, _) = transition(
            state,
            Input::BeginSwitch {
                target_id: "mentee-e".to_string(),
                target_label: None,
            },
        );
        let (state, _) = transition(
            state,
            Input::Confirmed {
                session: Some(session("s-new", SELF, "mentee-e", 2_000)),
            },
        );

        let viewing = derive_context(&state).viewing.unwrap();
        assert_eq!(viewing.session_id.as_deref(), Some("s-new"));
        assert_eq!(viewing.target_id, "mentee-e");
    }

    #[test]
    fn reconciliation_replaces_the_active_set() {
        let state = test_state();
        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-gone", SELF, "mentee-e", 1_000)),
        );

        // The refetch no longer lists s-gone but has s-current
        let (state, _) = transition(
            state,
            Input::Reconciled {
                sessions: vec![session("s-current", SELF, "mentee-e", 3_000)],
                targets: vec![],
            },
        );

        let ctx = derive_context(&state);
        assert!(ctx.reconciled);
        assert_eq!(
            ctx.viewing.unwrap().session_id.as_deref(),
            Some("s-current")
        );
        assert!(!state.sessions["s-gone"].is_active);
    }

    #[test]
    fn stale_activated_after_reconcile_is_ignored() {
        let state = test_state();
        let s = session("s-1", SELF, "mentee-e", 1_000);
        let (state, _) = transition(state, changed(ChangeKind::Created, s.clone()));

        // Outage: the session ends while we are not listening, the refetch
        // comes back empty, then the old Activated is replayed
        let (state, _) = transition(state, Input::Disconnected);
        assert!(!state.reconciled);
        let (state, _) = transition(
            state,
            Input::Reconciled {
                sessions: vec![],
                targets: vec![],
            },
        );
        let (state, _) = transition(state, changed(ChangeKind::Activated, s));

        assert_eq!(derive_context(&state).mode(), ViewMode::Own);
    }

    #[test]
    fn navigation_hint_selects_among_confirmed_sessions_only() {
        let state = test_state();
        let (state, _) = transition(
            state,
            Input::NavigationHint {
                target_id: "mentee-forged".to_string(),
            },
        );

        // No matching active session: the hint grants nothing
        assert_eq!(derive_context(&state).mode(), ViewMode::Own);

        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-a", SELF, "mentee-a", 1_000)),
        );
        let (state, _) = transition(
            state,
            changed(ChangeKind::Created, session("s-b", SELF, "mentee-b", 2_000)),
        );

        // Newest wins without a matching hint
        let ctx = derive_context(&state);
        assert_eq!(ctx.viewing.unwrap().target_id, "mentee-b");

        let (state, _) = transition(
            state,
            Input::NavigationHint {
                target_id: "mentee-a".to_string(),
            },
        );
        let ctx = derive_context(&state);
        assert_eq!(ctx.viewing.unwrap().target_id, "mentee-a");
    }

    #[test]
    fn exit_confirmation_with_known_end_snapshot_clears_view() {
        let state = test_state();
        let s = session("s-1", SELF, "mentee-e", 1_000);
        let (state, _) = transition(state, changed(ChangeKind::Created, s.clone()));
        let (state, _) = transition(state, Input::BeginExit);
        assert_eq!(derive_context(&state).mode(), ViewMode::Own);

        let (state, _) = transition(
            state,
            Input::Confirmed {
                session: Some(ended(s, 2_000)),
            },
        );
        assert_eq!(derive_context(&state).mode(), ViewMode::Own);
        assert!(state.optimistic.is_none());
    }
}
