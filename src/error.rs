//! Coordinator error taxonomy.
//!
//! Every operation returns [`CoordinatorError`]. Callers use
//! [`CoordinatorError::is_retryable`] to tell "try again" apart from
//! "this match is unrecoverable", and
//! [`CoordinatorError::is_integrity_violation`] to keep hidden-information
//! failures from being reported as ordinary round errors.

use crate::core::ids::{Address, MatchId, SessionId};
use crate::ledger::{LedgerError, PayloadError};
use crate::store::StoreError;

/// Result alias used across the crate.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors surfaced by the registration flow and the round ledger.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    /// Match, session or round record absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Address is not a participant of the match.
    #[error("{address} is not a participant in match {match_id}")]
    Forbidden {
        /// Match.
        match_id: MatchId,
        /// Offending address.
        address: Address,
    },

    /// A different commitment already exists for this key.
    #[error("{player} already committed for match {match_id} round {round} turn {turn}")]
    AlreadyCommitted {
        /// Match.
        match_id: MatchId,
        /// Round number.
        round: u32,
        /// Turn number.
        turn: u32,
        /// Committing player.
        player: Address,
    },

    /// Revealed move does not reproduce the stored commitment.
    #[error("reveal from {player} does not match commitment (match {match_id} round {round} turn {turn})")]
    RevealMismatch {
        /// Match.
        match_id: MatchId,
        /// Round number.
        round: u32,
        /// Turn number.
        turn: u32,
        /// Revealing player.
        player: Address,
    },

    /// A commitment's proof failed verification.
    #[error("proof from {player} rejected (match {match_id} round {round} turn {turn})")]
    ProofRejected {
        /// Match.
        match_id: MatchId,
        /// Round number.
        round: u32,
        /// Turn number.
        turn: u32,
        /// Player whose proof failed.
        player: Address,
    },

    /// Resolution attempted before both sides committed.
    #[error("round not ready: {0}")]
    RoundNotReady(String),

    /// The two reveals name different winners.
    #[error("reveals disagree on the winner (match {match_id} round {round} turn {turn})")]
    OutcomeDisputed {
        /// Match.
        match_id: MatchId,
        /// Round number.
        round: u32,
        /// Turn number.
        turn: u32,
    },

    /// Source sequence kept going stale; retries exhausted.
    #[error("transaction sequence still stale after {attempts} attempts")]
    StaleSequence {
        /// Attempts made.
        attempts: u32,
    },

    /// Every session id candidate is taken.
    #[error("no free session id for match {match_id} after {candidates} candidates")]
    AllocationExhausted {
        /// Match.
        match_id: MatchId,
        /// Candidates tried.
        candidates: usize,
    },

    /// Simulation result lacked authorization data.
    #[error("simulation incomplete: {0}")]
    SimulationIncomplete(String),

    /// Registration already submitted or completed.
    #[error("registration for match {0} already submitted")]
    AlreadySubmitted(MatchId),

    /// A collected authorization no longer fits the transaction and must
    /// be signed again.
    #[error("authorization from {address} no longer matches the transaction")]
    AuthorizationStale {
        /// Signer whose entry is stale.
        address: Address,
    },

    /// On-chain cancellation could not be confirmed while stake is locked.
    #[error("cancellation of session {session_id} for match {match_id} unconfirmed with stake at risk: {reason}")]
    CancellationUnconfirmed {
        /// Match.
        match_id: MatchId,
        /// Reserved session.
        session_id: SessionId,
        /// Underlying failure.
        reason: String,
    },

    /// Optimistic updates kept losing races.
    #[error("pending registration for match {0} kept changing concurrently")]
    Contention(MatchId),

    /// Ledger failure outside the retried class.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Transaction payload could not be encoded or decoded.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl CoordinatorError {
    /// Whether repeating the operation (possibly from `prepare`) can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StaleSequence { .. }
            | Self::SimulationIncomplete(_)
            | Self::AuthorizationStale { .. }
            | Self::Contention(_) => true,
            Self::Ledger(err) => matches!(err, LedgerError::StaleSequence | LedgerError::Other(_)),
            Self::Store(err) => matches!(err, StoreError::VersionConflict | StoreError::Backend(_)),
            _ => false,
        }
    }

    /// Hidden-information integrity failures: never retried, never masked.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyCommitted { .. } | Self::RevealMismatch { .. } | Self::ProofRejected { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::AlreadyCommitted { .. } => "already_committed",
            Self::RevealMismatch { .. } => "reveal_mismatch",
            Self::ProofRejected { .. } => "proof_rejected",
            Self::RoundNotReady(_) => "round_not_ready",
            Self::OutcomeDisputed { .. } => "outcome_disputed",
            Self::StaleSequence { .. } => "stale_sequence",
            Self::AllocationExhausted { .. } => "allocation_exhausted",
            Self::SimulationIncomplete(_) => "simulation_incomplete",
            Self::AlreadySubmitted(_) => "already_submitted",
            Self::AuthorizationStale { .. } => "authorization_stale",
            Self::CancellationUnconfirmed { .. } => "cancellation_unconfirmed",
            Self::Contention(_) => "contention",
            Self::Ledger(_) => "ledger",
            Self::Store(_) => "store",
            Self::Payload(_) => "payload",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let id = MatchId::new_v4();
        let player = Address::new("GALICE");

        assert!(CoordinatorError::StaleSequence { attempts: 4 }.is_retryable());
        assert!(CoordinatorError::Ledger(LedgerError::StaleSequence).is_retryable());
        assert!(!CoordinatorError::AllocationExhausted { match_id: id, candidates: 49 }.is_retryable());
        assert!(!CoordinatorError::Forbidden { match_id: id, address: player.clone() }.is_retryable());

        let mismatch = CoordinatorError::RevealMismatch { match_id: id, round: 1, turn: 1, player };
        assert!(mismatch.is_integrity_violation());
        assert!(!mismatch.is_retryable());
        assert_eq!(mismatch.code(), "reveal_mismatch");
    }

    #[test]
    fn test_from_conversions() {
        let err: CoordinatorError = LedgerError::NotFound("session 1".into()).into();
        assert_eq!(err.code(), "ledger");
        assert_eq!(err.to_string(), "not found: session 1");

        let err: CoordinatorError = StoreError::VersionConflict.into();
        assert!(err.is_retryable());
    }
}
