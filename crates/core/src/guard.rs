//! Mutation guard
//!
//! Gates write intents on the current `ViewContext`. Fail-closed: until the
//! first authoritative reconciliation, mutations are blocked even though no
//! delegation is known. Refused actions are never invoked and surface as a
//! single "read-only" notification, not as the underlying business error.

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use mentorview_protocol::ViewContext;
use thiserror::Error;
use tracing::debug;

use crate::notify::NotificationHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The client is a delegated viewer; the account is read-only
    #[error("account is in read-only delegated view")]
    ReadOnly,

    /// No authoritative delegation state yet (first reconciliation pending
    /// or the change channel is down)
    #[error("delegation state not yet known")]
    Indeterminate,
}

/// Synchronous gate in front of every mutating operation. Cheap to Clone;
/// reads the manager's snapshot lock-free.
#[derive(Clone)]
pub struct MutationGuard {
    snapshot: Arc<ArcSwap<ViewContext>>,
    notifier: NotificationHub,
}

impl MutationGuard {
    pub(crate) fn new(snapshot: Arc<ArcSwap<ViewContext>>, notifier: NotificationHub) -> Self {
        Self { snapshot, notifier }
    }

    /// Whether a mutation would currently be allowed, emitting the
    /// read-only notification when it would not
    pub fn check(&self) -> Result<(), GuardError> {
        let ctx = self.snapshot.load();
        let refusal = if ctx.viewing.is_some() {
            Some(GuardError::ReadOnly)
        } else if !ctx.reconciled {
            Some(GuardError::Indeterminate)
        } else {
            None
        };

        match refusal {
            Some(err) => {
                debug!(
                    component = "guard",
                    event = "guard.mutation.refused",
                    reason = %err,
                    "Mutation refused"
                );
                self.notifier.read_only_denied();
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Run `action` unless delegated; the refused action is never invoked
    pub fn guard<R>(&self, action: impl FnOnce() -> R) -> Result<R, GuardError> {
        self.check()?;
        Ok(action())
    }

    /// Asynchronous variant; the future is neither constructed nor polled
    /// when the mutation is refused
    pub async fn guard_async<F, Fut>(&self, action: F) -> Result<Fut::Output, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.check()?;
        Ok(action().await)
    }
}
