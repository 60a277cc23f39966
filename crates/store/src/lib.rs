//! Mentorview Session Store
//!
//! The persisted relation of delegation sessions plus its change-notification
//! channel, consumed by the core through a cloneable `StoreHandle`. Backends
//! run as dedicated tasks that own their state and process `StoreCommand`s
//! sequentially, so the one-active-session-per-mentee invariant is enforced
//! without locking.

use mentorview_protocol::{ChangeKind, DelegationError, DelegationSession, EligibleTarget};
use tokio::sync::{broadcast, mpsc, oneshot};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One row change on the store's notification channel
pub type ChangeNotice = (ChangeKind, DelegationSession);

/// Capacity of the change broadcast channel. A subscriber that falls more
/// than this far behind observes a lag and must reconcile.
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Commands processed by a store backend task
#[derive(Debug)]
pub enum StoreCommand {
    /// Create a delegation session, or return the existing active one for
    /// the same mentor/mentee pair
    CreateOrActivate {
        mentor_id: String,
        mentee_id: String,
        reply: oneshot::Sender<Result<DelegationSession, DelegationError>>,
    },

    /// End an active session, stamping `ended_at`
    Deactivate {
        session_id: String,
        reply: oneshot::Sender<Result<DelegationSession, DelegationError>>,
    },

    /// All active sessions where the identity is mentor or mentee
    ListActiveFor {
        identity: String,
        reply: oneshot::Sender<Result<Vec<DelegationSession>, DelegationError>>,
    },

    /// All identities the given mentor may switch into
    ListEligibleFor {
        identity: String,
        reply: oneshot::Sender<Result<Vec<EligibleTarget>, DelegationError>>,
    },

    /// Attach to the change-notification channel
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<ChangeNotice>>,
    },

    /// Record that `mentor_id` may view `mentee_id`
    Grant {
        mentor_id: String,
        mentee_id: String,
        label: Option<String>,
        reply: oneshot::Sender<Result<(), DelegationError>>,
    },

    /// Withdraw a grant. Does not end sessions already running under it.
    Revoke {
        mentor_id: String,
        mentee_id: String,
        reply: oneshot::Sender<Result<(), DelegationError>>,
    },

    /// Drop every change subscriber, as a transport outage would. Existing
    /// receivers observe `Closed` and must resubscribe + reconcile.
    ResetChangeChannel { reply: oneshot::Sender<()> },
}

/// Create the command channel shared by all backends
pub fn create_store_channel() -> (mpsc::Sender<StoreCommand>, mpsc::Receiver<StoreCommand>) {
    mpsc::channel(256)
}

/// Handle to a running store backend (cheap to Clone)
#[derive(Clone)]
pub struct StoreHandle {
    command_tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub fn new(command_tx: mpsc::Sender<StoreCommand>) -> Self {
        Self { command_tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> Result<T, DelegationError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| DelegationError::transport("store task is gone"))?;
        rx.await
            .map_err(|_| DelegationError::transport("store dropped the reply"))
    }

    pub async fn create_or_activate(
        &self,
        mentor_id: &str,
        mentee_id: &str,
    ) -> Result<DelegationSession, DelegationError> {
        let mentor_id = mentor_id.to_string();
        let mentee_id = mentee_id.to_string();
        self.request(|reply| StoreCommand::CreateOrActivate {
            mentor_id,
            mentee_id,
            reply,
        })
        .await?
    }

    pub async fn deactivate(
        &self,
        session_id: &str,
    ) -> Result<DelegationSession, DelegationError> {
        let session_id = session_id.to_string();
        self.request(|reply| StoreCommand::Deactivate { session_id, reply })
            .await?
    }

    pub async fn list_active_for(
        &self,
        identity: &str,
    ) -> Result<Vec<DelegationSession>, DelegationError> {
        let identity = identity.to_string();
        self.request(|reply| StoreCommand::ListActiveFor { identity, reply })
            .await?
    }

    pub async fn list_eligible_for(
        &self,
        identity: &str,
    ) -> Result<Vec<EligibleTarget>, DelegationError> {
        let identity = identity.to_string();
        self.request(|reply| StoreCommand::ListEligibleFor { identity, reply })
            .await?
    }

    pub async fn subscribe_changes(
        &self,
    ) -> Result<broadcast::Receiver<ChangeNotice>, DelegationError> {
        self.request(|reply| StoreCommand::Subscribe { reply }).await
    }

    pub async fn grant(
        &self,
        mentor_id: &str,
        mentee_id: &str,
        label: Option<&str>,
    ) -> Result<(), DelegationError> {
        let mentor_id = mentor_id.to_string();
        let mentee_id = mentee_id.to_string();
        let label = label.map(str::to_string);
        self.request(|reply| StoreCommand::Grant {
            mentor_id,
            mentee_id,
            label,
            reply,
        })
        .await?
    }

    pub async fn revoke(&self, mentor_id: &str, mentee_id: &str) -> Result<(), DelegationError> {
        let mentor_id = mentor_id.to_string();
        let mentee_id = mentee_id.to_string();
        self.request(|reply| StoreCommand::Revoke {
            mentor_id,
            mentee_id,
            reply,
        })
        .await?
    }

    pub async fn reset_change_channel(&self) -> Result<(), DelegationError> {
        self.request(|reply| StoreCommand::ResetChangeChannel { reply })
            .await
    }
}
