//! Transaction Preparer
//!
//! Builds an invocation transaction by simulating it, then pulls out the
//! unsigned authorization entry each expected signer has to sign.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::core::ids::{Address, SessionId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::tx::Invocation;
use crate::ledger::LedgerClient;
use crate::registration::PreparedRegistration;
use crate::store::MatchRecord;

/// Registration invocation for a match on `session_id`.
pub fn registration_invocation(record: &MatchRecord, session_id: SessionId) -> Invocation {
    Invocation::StartMatch {
        session_id,
        player1: record.player1.clone(),
        player2: record.player2.clone(),
        player1_points: record.stake_amount(),
        player2_points: record.stake_amount(),
    }
}

/// Simulates invocations on behalf of the service account.
pub struct TransactionPreparer {
    ledger: Arc<dyn LedgerClient>,
    source: Address,
    auth_validity_ledgers: u32,
}

impl TransactionPreparer {
    /// Create a preparer building transactions sourced from `source`.
    pub fn new(ledger: Arc<dyn LedgerClient>, source: Address, auth_validity_ledgers: u32) -> Self {
        Self { ledger, source, auth_validity_ledgers }
    }

    /// Service account.
    pub fn source(&self) -> &Address {
        &self.source
    }

    /// Simulate `invocation` and extract one unsigned entry per required
    /// signer.
    ///
    /// `signers` lists the addresses allowed to be asked for a signature.
    /// The source account's own authorization is covered by the envelope
    /// signature and never appears in the required set.
    #[instrument(skip(self, invocation, signers), fields(invocation = invocation.name(), session_id = %invocation.session_id()))]
    pub async fn prepare(
        &self,
        invocation: Invocation,
        signers: &[Address],
    ) -> CoordinatorResult<PreparedRegistration> {
        let simulation = self.ledger.simulate(&self.source, &invocation).await?;
        let required = simulation.required_auth.ok_or_else(|| {
            CoordinatorError::SimulationIncomplete("simulation returned no authorization data".into())
        })?;

        let mut auth_entries = BTreeMap::new();
        let mut required_auth_addresses = Vec::new();
        for entry in required {
            if entry.address == self.source {
                continue;
            }
            if !signers.contains(&entry.address) {
                return Err(CoordinatorError::SimulationIncomplete(format!(
                    "execution plan requires unexpected signer {}",
                    entry.address
                )));
            }
            if simulation.transaction.auth_slot(&entry.address).is_none() {
                return Err(CoordinatorError::SimulationIncomplete(format!(
                    "no authorization slot for {} in simulated transaction",
                    entry.address
                )));
            }
            required_auth_addresses.push(entry.address.clone());
            auth_entries.insert(entry.address.clone(), entry);
        }

        let payload = simulation.transaction.to_payload()?;
        let auth_valid_until = simulation.latest_ledger.saturating_add(self.auth_validity_ledgers);

        debug!(
            required = required_auth_addresses.len(),
            sequence = simulation.transaction.sequence,
            auth_valid_until,
            "transaction prepared"
        );

        Ok(PreparedRegistration {
            session_id: invocation.session_id(),
            transaction: simulation.transaction,
            payload,
            auth_entries,
            required_auth_addresses,
            latest_ledger: simulation.latest_ledger,
            auth_valid_until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::MatchId;
    use crate::ledger::tx::Transaction;
    use crate::ledger::InMemoryLedger;

    fn record() -> MatchRecord {
        MatchRecord::new(MatchId::new_v4(), Address::new("GALICE"), Address::new("GBOB")).with_stake(25)
    }

    fn players() -> Vec<Address> {
        vec![Address::new("GALICE"), Address::new("GBOB")]
    }

    #[tokio::test]
    async fn test_prepare_extracts_both_players() {
        let ledger = Arc::new(InMemoryLedger::new());
        let preparer = TransactionPreparer::new(ledger, Address::new("GSERVICE"), 60);
        let invocation = registration_invocation(&record(), SessionId::new(9).unwrap());

        let prepared = preparer.prepare(invocation, &players()).await.unwrap();
        assert_eq!(prepared.required_auth_addresses, players());
        assert_eq!(prepared.auth_entries.len(), 2);
        assert!(prepared.auth_entries.values().all(|e| !e.is_signed()));
        assert_eq!(prepared.auth_valid_until, prepared.latest_ledger + 60);
        assert_eq!(Transaction::from_payload(&prepared.payload).unwrap(), prepared.transaction);
    }

    #[tokio::test]
    async fn test_missing_auth_data_is_incomplete() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.inject_missing_auth(1).await;
        let preparer = TransactionPreparer::new(ledger, Address::new("GSERVICE"), 60);
        let invocation = registration_invocation(&record(), SessionId::new(9).unwrap());

        let err = preparer.prepare(invocation, &players()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SimulationIncomplete(_)));
    }

    #[tokio::test]
    async fn test_unexpected_signer_is_incomplete() {
        let ledger = Arc::new(InMemoryLedger::new());
        let preparer = TransactionPreparer::new(ledger, Address::new("GSERVICE"), 60);
        let invocation = registration_invocation(&record(), SessionId::new(9).unwrap());

        let err = preparer.prepare(invocation, &[Address::new("GALICE")]).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SimulationIncomplete(msg) if msg.contains("GBOB")));
    }

    #[tokio::test]
    async fn test_cancel_needs_no_player_auth() {
        let ledger = Arc::new(InMemoryLedger::new());
        let session = SessionId::new(3).unwrap();
        ledger
            .insert_match(session, crate::ledger::OnChainMatch {
                player1: Address::new("GALICE"),
                player2: Address::new("GBOB"),
                player1_points: 0,
                player2_points: 0,
            })
            .await;
        let preparer = TransactionPreparer::new(ledger, Address::new("GSERVICE"), 60);

        let prepared = preparer
            .prepare(Invocation::CancelMatch { session_id: session }, &[])
            .await
            .unwrap();
        assert!(prepared.required_auth_addresses.is_empty());
    }
}
