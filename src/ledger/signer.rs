//! Signing seams.
//!
//! Players sign their own authorization entries in their wallet; the
//! service only ever signs the transaction envelope with its own key.

use async_trait::async_trait;

use crate::core::ids::Address;
use crate::ledger::tx::{AuthEntry, SignedEnvelope, Transaction};
use crate::ledger::LedgerError;

/// A player's wallet.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Address the wallet signs for.
    fn address(&self) -> &Address;

    /// Sign `entry`, valid until `valid_until_ledger`.
    ///
    /// Returns [`LedgerError::NoSignatureNeeded`] when the entry belongs
    /// to someone else.
    async fn sign_auth(
        &self,
        entry: &AuthEntry,
        valid_until_ledger: u32,
    ) -> Result<AuthEntry, LedgerError>;
}

/// Holder of the service (transaction source) key.
pub trait EnvelopeSigner: Send + Sync {
    /// Source account this signer controls.
    fn source(&self) -> &Address;

    /// Sign the envelope of `tx`.
    fn sign_envelope(&self, tx: Transaction) -> SignedEnvelope;
}
