//! Mentorview Core
//!
//! Delegated-view subsystem: lets a mentor temporarily assume a read-only
//! view of a mentee's account, with delegation state synchronized in real
//! time across the mentee's clients and all mutations blocked while the
//! view is active.
//!
//! One [`manager::ContextHandle`] per client process is the single source
//! of truth; the [`synchronizer`] feeds it store change events, the
//! [`guard`] gates write intents on its snapshot, [`navigation`] carries
//! the delegated target across route transitions, and [`notify`] surfaces
//! start/stop alerts exactly once per transition.

pub mod guard;
pub mod logging;
pub mod manager;
pub mod navigation;
pub mod notify;
pub mod synchronizer;
pub mod transition;

pub use guard::{GuardError, MutationGuard};
pub use manager::{ContextHandle, SyncEvent};
pub use notify::NotificationHub;
