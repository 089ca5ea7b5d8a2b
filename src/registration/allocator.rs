//! Session Allocator
//!
//! Derives a numeric session id for a match and makes sure no other match
//! in the store, and no existing on-chain session, already uses it.
//!
//! Candidates are deterministic: the preferred one hashes the match id,
//! fallbacks hash `(match id, attempt)`. Checking is not reserving; the
//! store's uniqueness constraint closes the race between the two, and
//! [`SessionAllocator::allocate_and_reserve`] retries when it loses.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::hash::{truncate_u32, DomainHasher};
use crate::core::ids::{MatchId, SessionId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::LedgerClient;
use crate::store::{MatchStore, StoreError};

/// Preferred session id for a match.
pub fn preferred_candidate(match_id: &MatchId) -> SessionId {
    let mut hasher = DomainHasher::for_session_candidate();
    hasher.update_uuid(match_id.as_bytes());
    SessionId::from_raw(truncate_u32(&hasher.finalize()))
}

/// Fallback candidate number `attempt` (1-based).
pub fn fallback_candidate(match_id: &MatchId, attempt: u32) -> SessionId {
    let mut hasher = DomainHasher::for_session_candidate();
    hasher.update_uuid(match_id.as_bytes());
    hasher.update_u32(attempt);
    SessionId::from_raw(truncate_u32(&hasher.finalize()))
}

/// Ordered, de-duplicated candidate list: preferred first, then fallbacks.
pub fn candidates(match_id: &MatchId, fallbacks: usize) -> Vec<SessionId> {
    let mut seen = BTreeSet::new();
    std::iter::once(preferred_candidate(match_id))
        .chain((1..=fallbacks as u32).map(|attempt| fallback_candidate(match_id, attempt)))
        .filter(|candidate| seen.insert(*candidate))
        .collect()
}

/// Session id allocator.
pub struct SessionAllocator {
    ledger: Arc<dyn LedgerClient>,
    matches: Arc<dyn MatchStore>,
    fallbacks: usize,
}

impl SessionAllocator {
    /// Create an allocator trying `fallbacks` candidates after the preferred one.
    pub fn new(ledger: Arc<dyn LedgerClient>, matches: Arc<dyn MatchStore>, fallbacks: usize) -> Self {
        Self { ledger, matches, fallbacks }
    }

    /// Find a session id free both in the store and on-chain.
    ///
    /// Does not reserve it.
    pub async fn allocate(&self, match_id: &MatchId) -> CoordinatorResult<SessionId> {
        let candidates = candidates(match_id, self.fallbacks);
        for (index, candidate) in candidates.iter().enumerate() {
            if self.is_free(match_id, *candidate).await? {
                if index > 0 {
                    debug!(match_id = %match_id, session_id = %candidate, index, "using fallback session id");
                }
                return Ok(*candidate);
            }
        }

        warn!(match_id = %match_id, tried = candidates.len(), "session id candidates exhausted");
        Err(CoordinatorError::AllocationExhausted {
            match_id: *match_id,
            candidates: candidates.len(),
        })
    }

    /// Return the match's reserved session id, or allocate and reserve one.
    pub async fn allocate_and_reserve(&self, match_id: &MatchId) -> CoordinatorResult<SessionId> {
        let record = self
            .matches
            .get(match_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("match {}", match_id)))?;
        if let Some(existing) = record.session_id {
            return Ok(existing);
        }

        // Each lost race makes one more candidate visibly taken, so this
        // terminates within the candidate count.
        for _ in 0..=self.fallbacks {
            let candidate = self.allocate(match_id).await?;
            match self.matches.reserve_session(match_id, candidate).await {
                Ok(()) => {
                    info!(match_id = %match_id, session_id = %candidate, "session id reserved");
                    return Ok(candidate);
                }
                Err(StoreError::SessionTaken { owner, .. }) => {
                    debug!(match_id = %match_id, session_id = %candidate, owner = %owner, "lost session id race");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CoordinatorError::AllocationExhausted {
            match_id: *match_id,
            candidates: self.fallbacks + 1,
        })
    }

    async fn is_free(&self, match_id: &MatchId, candidate: SessionId) -> CoordinatorResult<bool> {
        if let Some(owner) = self.matches.session_owner(candidate).await? {
            if &owner != match_id {
                return Ok(false);
            }
        }
        Ok(self.ledger.query_state(candidate).await?.is_none())
    }
}
