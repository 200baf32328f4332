//! # Quill Session
//!
//! Sessions are TTL-bound identity contexts. Each one owns an ordered,
//! capped history of DSL snapshots that supports undo and a full reset.
//!
//! ## Lifecycle
//!
//! ```text
//!   create_or_get ──▶ active ──renew──▶ active ──ttl elapsed──▶ evicted
//!                       │                                         │
//!                 create_snapshot / undo / reset          history deleted
//! ```
//!
//! Expired sessions are evicted lazily on access or by `sweep_expired`.

use quill_core::DslDocument;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod manager;
pub mod store;

pub use manager::SessionManager;
pub use store::{MemorySessionStore, MemorySnapshotStore, SessionEntry, SessionStore, SnapshotStore};

/// Session manager settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sliding session lifetime
    pub ttl_secs: u64,
    /// Active snapshots kept per session
    pub max_history: usize,
    /// Undone snapshots kept per session before the oldest are deleted
    pub max_detached: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            max_history: 5,
            max_detached: 5,
        }
    }
}

/// Per-session usage counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub request_count: u64,
    pub transform_count: u64,
}

/// A TTL-bound identity context
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// One-way hash of IP and user agent
    pub identity_hash: String,
    pub created_at: i64,
    pub ttl_at: i64,
    pub quota: Quota,
}

impl Session {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.ttl_at
    }

    pub fn ttl_remaining_ms(&self, now: i64) -> i64 {
        (self.ttl_at - now).max(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub timestamp: i64,
    pub note: Option<String>,
}

/// Immutable record of one accepted DSL document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub dsl: DslDocument,
    pub metadata: SnapshotMetadata,
    pub created_at: i64,
}

/// Result of `undo` and `reset_to_initial`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UndoOutcome {
    /// Detached snapshot ids, newest first
    pub removed: Vec<String>,
    /// New tail of the history, `None` when it is empty
    pub current: Option<Snapshot>,
}

/// Read-only view of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub snapshot_count: usize,
    pub current_snapshot_id: Option<String>,
    pub ttl_remaining_ms: i64,
    pub can_undo: bool,
    pub quota: Quota,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub stored_snapshots: usize,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub sessions_destroyed: u64,
    pub sessions_discarded: u64,
    pub snapshots_created: u64,
    pub snapshots_evicted: u64,
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session expired: {0}")]
    Expired(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_expiry() {
        let session = Session {
            id: "sess_1".to_string(),
            identity_hash: "h".to_string(),
            created_at: 0,
            ttl_at: 1_000,
            quota: Quota::default(),
        };
        assert!(!session.is_expired(999));
        assert!(session.is_expired(1_000));
        assert_eq!(session.ttl_remaining_ms(400), 600);
        assert_eq!(session.ttl_remaining_ms(5_000), 0);
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.ttl_secs, 1800);
        assert_eq!(config.max_history, 5);
    }
}
