//! Mentorview Protocol
//!
//! Shared types for the delegated-view subsystem: session rows, change
//! events, the derived per-client view context, and the error taxonomy.
//! Serialized as JSON wherever they cross a process boundary.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

// Re-exports
pub mod error;
pub mod events;
pub mod types;

pub use error::DelegationError;
pub use events::{ChangeKind, SessionChangeEvent};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
