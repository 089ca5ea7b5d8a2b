//! Storage seams.
//!
//! - `matches`: persistent match records (owns the session id constraint)
//! - `pending`: versioned in-flight registration state

pub mod matches;
pub mod pending;

use crate::core::ids::{MatchId, SessionId};

pub use matches::{InMemoryMatchStore, MatchRecord, MatchStatus, MatchStore, Stake};
pub use pending::{InMemoryPendingStore, PendingStore, Versioned};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No record for the match.
    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    /// Session id uniqueness constraint violated.
    #[error("session {session_id} already reserved by match {owner}")]
    SessionTaken {
        /// Contested session id.
        session_id: SessionId,
        /// Match holding it.
        owner: MatchId,
    },

    /// Optimistic write lost a race.
    #[error("record changed concurrently")]
    VersionConflict,

    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}
