//! Ledger Collaborator
//!
//! The contract platform as this crate sees it: simulate an invocation,
//! submit a signed envelope, query on-chain match state.
//!
//! Failures come back as a typed [`LedgerError`] so retry decisions never
//! depend on parsing error message text.

pub mod memory;
pub mod signer;
pub mod tx;

use async_trait::async_trait;

use crate::core::ids::{Address, SessionId, TxId};

pub use memory::{DevEnvelopeSigner, DevWallet, InMemoryLedger};
pub use signer::{EnvelopeSigner, Wallet};
pub use tx::{AuthEntry, Invocation, OnChainMatch, PayloadError, SignedEnvelope, Simulation, Transaction};

/// Ledger error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The source account sequence moved on while the transaction was
    /// being assembled.
    #[error("transaction sequence number is stale")]
    StaleSequence,

    /// The entry presented for signing does not need this signer.
    #[error("no signature needed")]
    NoSignatureNeeded,

    /// The referenced session (or account) does not exist on-chain.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else the ledger reports.
    #[error("ledger error: {0}")]
    Other(String),
}

impl LedgerError {
    /// Whether this is the stale-sequence class handled by rebuild + retry.
    pub fn is_stale_sequence(&self) -> bool {
        matches!(self, Self::StaleSequence)
    }
}

/// Contract platform client.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Dry-run `invocation` with `source` as the transaction source.
    async fn simulate(
        &self,
        source: &Address,
        invocation: &Invocation,
    ) -> Result<Simulation, LedgerError>;

    /// Re-simulate an assembled transaction after authorization injection
    /// and return it with refreshed resource fees.
    async fn simulate_transaction(&self, tx: &Transaction) -> Result<Transaction, LedgerError>;

    /// Submit a signed envelope.
    async fn submit(&self, envelope: &SignedEnvelope) -> Result<TxId, LedgerError>;

    /// Read match state for `session_id`, if any.
    async fn query_state(&self, session_id: SessionId) -> Result<Option<OnChainMatch>, LedgerError>;
}
