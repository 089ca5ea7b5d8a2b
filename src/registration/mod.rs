//! Client-Signed Match Registration
//!
//! ## Flow
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌─────────────┐   ┌───────────┐
//! │ allocator │──►│ preparer │──►│ coordinator │──►│  retrier  │──► ledger
//! │ session id│   │ simulate │   │ collect A,B │   │ stale seq │
//! └───────────┘   └──────────┘   └──────┬──────┘   └───────────┘
//!                                       │ timeout / disconnect
//!                                       ▼
//!                                ┌─────────────┐
//!                                │   cancel    │
//!                                └─────────────┘
//! ```
//!
//! - `allocator.rs`   - collision-free session id reservation
//! - `preparer.rs`    - simulate + extract per-signer authorization entries
//! - `coordinator.rs` - per-match state machine, exactly-once submission
//! - `retrier.rs`     - assembly, submission, stale-sequence rebuild
//! - `cancel.rs`      - on-chain reversal and off-chain compensation
//! - `status.rs`      - client-observable status and the client signing helper

pub mod allocator;
pub mod cancel;
pub mod coordinator;
pub mod preparer;
pub mod retrier;
pub mod status;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{Address, MatchId, SessionId};
use crate::ledger::tx::{AuthEntry, Transaction};

pub use allocator::SessionAllocator;
pub use cancel::{CancelOutcome, CancellationService, OnChainCancel};
pub use coordinator::{
    CoordinatorDeps, PrepareOutcome, RegistrationCoordinator, RegistrationProgress, RegistrationView,
};
pub use preparer::TransactionPreparer;
pub use retrier::{SubmissionOutcome, SubmissionRetrier};
pub use status::{sign_as_client, ClientRegistration, InvalidTransition, RegistrationStatus};

/// Output of the transaction preparer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedRegistration {
    /// Session the invocation targets.
    pub session_id: SessionId,
    /// Unsigned transaction.
    pub transaction: Transaction,
    /// Encoded transaction, as handed to clients.
    pub payload: String,
    /// Unsigned authorization entry per required address.
    pub auth_entries: BTreeMap<Address, AuthEntry>,
    /// Addresses that must authorize, in transaction order.
    pub required_auth_addresses: Vec<Address>,
    /// Ledger height the simulation ran against (0 if unknown).
    pub latest_ledger: u32,
    /// Expiration bound players should sign with.
    pub auth_valid_until: u32,
}

/// Coordinator phase for one match.
///
/// `unprepared` is the absence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPhase {
    /// Transaction prepared, no signatures yet.
    Prepared,
    /// Some signatures collected.
    Collecting,
    /// Quorum reached; submission in flight.
    Submitting,
    /// Last submission failed; signatures cleared.
    Failed,
    /// Cancelled.
    Cancelled,
}

/// Per-match in-flight registration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRegistration {
    /// Match.
    pub match_id: MatchId,
    /// Prepared transaction material.
    pub prepared: PreparedRegistration,
    /// First player.
    pub player1: Address,
    /// Second player.
    pub player2: Address,
    /// Signed authorization per address.
    pub signatures: BTreeMap<Address, AuthEntry>,
    /// Mutual-exclusion guard: set before submission starts.
    pub submitted: bool,
    /// Current phase.
    pub phase: RegistrationPhase,
    /// Cancel reason received while a submission was in flight.
    pub cancel_requested: Option<String>,
    /// When the transaction was (last) prepared.
    pub prepared_at: DateTime<Utc>,
}

impl PendingRegistration {
    /// Fresh record seeded from a prepared transaction.
    pub fn new(match_id: MatchId, prepared: PreparedRegistration, player1: Address, player2: Address) -> Self {
        Self {
            match_id,
            prepared,
            player1,
            player2,
            signatures: BTreeMap::new(),
            submitted: false,
            phase: RegistrationPhase::Prepared,
            cancel_requested: None,
            prepared_at: Utc::now(),
        }
    }

    /// Required addresses that have signed.
    pub fn signed_addresses(&self) -> Vec<Address> {
        self.prepared
            .required_auth_addresses
            .iter()
            .filter(|a| self.signatures.contains_key(*a))
            .cloned()
            .collect()
    }

    /// Required addresses still missing.
    pub fn missing_addresses(&self) -> Vec<Address> {
        self.prepared
            .required_auth_addresses
            .iter()
            .filter(|a| !self.signatures.contains_key(*a))
            .cloned()
            .collect()
    }

    /// Whether every required address has signed.
    pub fn has_quorum(&self) -> bool {
        self.missing_addresses().is_empty()
    }
}
