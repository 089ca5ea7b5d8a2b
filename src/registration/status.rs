//! Client Registration Status
//!
//! What a player's client shows while its match registers, and the
//! client-side signing routine that drives it. Status only moves forward,
//! with one exception: `submitting` may fall back to `waiting_for_opponent`
//! when the client learns its submission was not the one that completed
//! the quorum.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::ids::{Address, MatchId};
use crate::error::CoordinatorError;
use crate::ledger::{LedgerError, Wallet};
use crate::network::notify::MatchNotification;
use crate::registration::coordinator::{PrepareOutcome, RegistrationCoordinator, RegistrationProgress};

/// Client-observable registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Nothing started.
    Idle,
    /// Asking the coordinator for the transaction.
    Preparing,
    /// Wallet prompt open.
    Signing,
    /// Own signature recorded; opponent has not signed.
    WaitingForOpponent,
    /// Submission in flight.
    Submitting,
    /// Registered on-chain.
    Complete,
    /// Failed; sign again from scratch.
    Error,
    /// This client does not need to sign.
    Skipped,
}

impl RegistrationStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Preparing => 1,
            Self::Signing => 2,
            Self::WaitingForOpponent => 3,
            Self::Submitting => 4,
            Self::Complete | Self::Error | Self::Skipped => 5,
        }
    }

    /// Whether the status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Skipped)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == Self::Submitting && next == Self::WaitingForOpponent {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl From<&RegistrationProgress> for RegistrationStatus {
    fn from(progress: &RegistrationProgress) -> Self {
        match progress {
            RegistrationProgress::Waiting { .. } => Self::WaitingForOpponent,
            RegistrationProgress::Submitting => Self::Submitting,
            RegistrationProgress::NotRequired => Self::Skipped,
            RegistrationProgress::Complete { .. } => Self::Complete,
        }
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid registration status transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// Current status.
    pub from: RegistrationStatus,
    /// Requested status.
    pub to: RegistrationStatus,
}

/// One client's view of a match registration.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    /// Match.
    pub match_id: MatchId,
    /// This client's address.
    pub address: Address,
    status: RegistrationStatus,
    /// Failure that moved the status to `error`.
    pub error: Option<CoordinatorError>,
}

impl ClientRegistration {
    /// Idle tracker.
    pub fn new(match_id: MatchId, address: Address) -> Self {
        Self {
            match_id,
            address,
            status: RegistrationStatus::Idle,
            error: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> RegistrationStatus {
        self.status
    }

    /// Move to `next` if allowed.
    pub fn advance(&mut self, next: RegistrationStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }
        debug!(match_id = %self.match_id, from = ?self.status, to = ?next, "registration status");
        self.status = next;
        Ok(())
    }

    /// Record a failure.
    pub fn fail(&mut self, error: CoordinatorError) {
        if self.advance(RegistrationStatus::Error).is_ok() {
            self.error = Some(error);
        }
    }

    /// Start over after an error.
    pub fn reset(&mut self) {
        self.status = RegistrationStatus::Idle;
        self.error = None;
    }

    /// Apply a pushed notification. Out-of-order events are ignored.
    pub fn observe(&mut self, event: &MatchNotification) {
        let next = match event {
            MatchNotification::RegistrationAuthReceived { waiting_for, .. } if waiting_for.is_empty() => {
                RegistrationStatus::Submitting
            }
            MatchNotification::RegistrationComplete { .. } => RegistrationStatus::Complete,
            MatchNotification::RegistrationFailed { .. } | MatchNotification::MatchCancelled { .. } => {
                RegistrationStatus::Error
            }
            _ => return,
        };
        if let Err(e) = self.advance(next) {
            debug!(match_id = %self.match_id, error = %e, "ignoring stale event");
        }
    }

    fn step(&mut self, next: RegistrationStatus) {
        if let Err(e) = self.advance(next) {
            warn!(match_id = %self.match_id, error = %e, "unexpected status transition");
        }
    }
}

/// Sign this client's share of a match registration.
///
/// Prepares (or fetches) the transaction, signs the wallet's own entry and
/// hands it to the coordinator. The returned tracker carries the final
/// status; on failure it is `error` with the cause attached.
pub async fn sign_as_client(
    coordinator: &RegistrationCoordinator,
    match_id: &MatchId,
    wallet: &dyn Wallet,
) -> ClientRegistration {
    let address = wallet.address().clone();
    let mut tracker = ClientRegistration::new(*match_id, address.clone());
    tracker.step(RegistrationStatus::Preparing);

    let view = match coordinator.prepare(match_id).await {
        Ok(PrepareOutcome::AwaitingSignatures(view)) => view,
        Ok(PrepareOutcome::Registered { .. }) => {
            tracker.step(RegistrationStatus::Complete);
            return tracker;
        }
        Err(e) => {
            tracker.fail(e);
            return tracker;
        }
    };

    let Some(entry) = view.entry_for(&address) else {
        tracker.step(RegistrationStatus::Skipped);
        return tracker;
    };

    tracker.step(RegistrationStatus::Signing);
    let signed = match wallet.sign_auth(entry, view.auth_valid_until).await {
        Ok(signed) => signed,
        Err(LedgerError::NoSignatureNeeded) => {
            tracker.step(RegistrationStatus::Skipped);
            return tracker;
        }
        Err(e) => {
            tracker.fail(e.into());
            return tracker;
        }
    };

    match coordinator.submit_auth(match_id, &address, signed, Some(&view.payload)).await {
        Ok(progress) => tracker.step(RegistrationStatus::from(&progress)),
        Err(e) => tracker.fail(e),
    }
    tracker
}
