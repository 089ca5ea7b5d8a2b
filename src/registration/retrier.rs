//! Submission Retrier
//!
//! Assembles a prepared transaction with the collected authorizations,
//! signs the envelope and submits it. A stale source sequence triggers a
//! rebuild (fresh simulation) that reuses the signed entries as long as
//! they still fit; any other ledger error is final.
//!
//! Submission that reports failure may still have landed. Before every
//! rebuild, and once more after the last attempt, the on-chain state is
//! checked so a landed transaction is reported as success instead of
//! being sent again.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::core::ids::{Address, TxId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::tx::{AuthEntry, Invocation, Transaction};
use crate::ledger::{EnvelopeSigner, LedgerClient, LedgerError};
use crate::registration::preparer::TransactionPreparer;
use crate::registration::PreparedRegistration;

/// How a submission ended successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Our transaction landed.
    Landed {
        /// Ledger transaction id.
        tx_id: TxId,
    },
    /// Submission reported failure, but the on-chain state shows the
    /// invocation's effect is in place.
    AlreadyOnChain,
}

impl SubmissionOutcome {
    /// Transaction id, if known.
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            Self::Landed { tx_id } => Some(tx_id.clone()),
            Self::AlreadyOnChain => None,
        }
    }
}

/// Submits prepared transactions with bounded stale-sequence retries.
pub struct SubmissionRetrier {
    ledger: Arc<dyn LedgerClient>,
    preparer: Arc<TransactionPreparer>,
    signer: Arc<dyn EnvelopeSigner>,
    retry: RetryConfig,
}

impl SubmissionRetrier {
    /// Create a retrier.
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        preparer: Arc<TransactionPreparer>,
        signer: Arc<dyn EnvelopeSigner>,
        retry: RetryConfig,
    ) -> Self {
        Self { ledger, preparer, signer, retry }
    }

    /// Submit `prepared` with `signatures` injected.
    ///
    /// `signers` is forwarded to the preparer on rebuild.
    pub async fn submit(
        &self,
        prepared: &PreparedRegistration,
        signatures: &BTreeMap<Address, AuthEntry>,
        signers: &[Address],
    ) -> CoordinatorResult<SubmissionOutcome> {
        let invocation = prepared.transaction.invocation.clone();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut current = prepared.clone();

        for attempt in 1..=max_attempts {
            match self.attempt(&current, signatures).await {
                Ok(tx_id) => {
                    info!(
                        invocation = invocation.name(),
                        session_id = %current.session_id,
                        tx_id = %tx_id,
                        attempt,
                        "transaction landed"
                    );
                    return Ok(SubmissionOutcome::Landed { tx_id });
                }
                Err(CoordinatorError::Ledger(LedgerError::StaleSequence)) => {
                    warn!(
                        invocation = invocation.name(),
                        session_id = %current.session_id,
                        attempt,
                        max_attempts,
                        "stale source sequence"
                    );
                    if self.effect_on_chain(&invocation).await? {
                        info!(session_id = %current.session_id, "invocation already applied on-chain");
                        return Ok(SubmissionOutcome::AlreadyOnChain);
                    }
                    if attempt == max_attempts {
                        break;
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    current = self.preparer.prepare(invocation.clone(), signers).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if self.effect_on_chain(&invocation).await? {
            return Ok(SubmissionOutcome::AlreadyOnChain);
        }
        Err(CoordinatorError::StaleSequence { attempts: max_attempts })
    }

    async fn attempt(
        &self,
        prepared: &PreparedRegistration,
        signatures: &BTreeMap<Address, AuthEntry>,
    ) -> CoordinatorResult<TxId> {
        let tx = assemble(prepared, signatures)?;
        let tx = self.ledger.simulate_transaction(&tx).await?;
        let envelope = self.signer.sign_envelope(tx);
        debug!(sequence = envelope.transaction.sequence, fee = envelope.transaction.resource_fee, "submitting");
        Ok(self.ledger.submit(&envelope).await?)
    }

    /// Whether the invocation's intended state is already on-chain.
    async fn effect_on_chain(&self, invocation: &Invocation) -> CoordinatorResult<bool> {
        let state = self.ledger.query_state(invocation.session_id()).await?;
        Ok(match (invocation, state) {
            (Invocation::StartMatch { player1, player2, .. }, Some(on_chain)) => {
                &on_chain.player1 == player1 && &on_chain.player2 == player2
            }
            (Invocation::StartMatch { .. }, None) => false,
            (Invocation::CancelMatch { .. }, state) => state.is_none(),
        })
    }
}

/// Put signed entries into the prepared transaction.
///
/// Every required address must have a signed entry that can replace the
/// current placeholder; signatures from addresses the transaction does not
/// need are ignored.
pub fn assemble(
    prepared: &PreparedRegistration,
    signatures: &BTreeMap<Address, AuthEntry>,
) -> CoordinatorResult<Transaction> {
    let mut tx = prepared.transaction.clone();
    for address in &prepared.required_auth_addresses {
        let stale = || CoordinatorError::AuthorizationStale { address: address.clone() };
        let placeholder = prepared.auth_entries.get(address).ok_or_else(stale)?;
        let signed = signatures.get(address).ok_or_else(stale)?;
        if !signed.can_replace(placeholder, prepared.latest_ledger) {
            return Err(stale());
        }
        if !tx.inject(signed.clone()) {
            return Err(stale());
        }
    }
    for address in signatures.keys() {
        if !prepared.required_auth_addresses.contains(address) {
            debug!(address = %address, "ignoring signature the transaction does not need");
        }
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::SessionId;
    use crate::ledger::{DevEnvelopeSigner, DevWallet, InMemoryLedger, Wallet};

    fn players() -> Vec<Address> {
        vec![Address::new("GALICE"), Address::new("GBOB")]
    }

    fn start(session: u32) -> Invocation {
        Invocation::StartMatch {
            session_id: SessionId::new(session).unwrap(),
            player1: Address::new("GALICE"),
            player2: Address::new("GBOB"),
            player1_points: 0,
            player2_points: 0,
        }
    }

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        preparer: Arc<TransactionPreparer>,
        retrier: SubmissionRetrier,
    }

    fn harness(max_attempts: u32) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let service = Address::new("GSERVICE");
        let preparer = Arc::new(TransactionPreparer::new(ledger.clone(), service.clone(), 60));
        let retrier = SubmissionRetrier::new(
            ledger.clone(),
            preparer.clone(),
            Arc::new(DevEnvelopeSigner::new(service)),
            RetryConfig::immediate(max_attempts),
        );
        Harness { ledger, preparer, retrier }
    }

    async fn sign_all(prepared: &PreparedRegistration) -> BTreeMap<Address, AuthEntry> {
        let mut signatures = BTreeMap::new();
        for (address, entry) in &prepared.auth_entries {
            let wallet = DevWallet::new(address.clone());
            let signed = wallet.sign_auth(entry, prepared.auth_valid_until).await.unwrap();
            signatures.insert(address.clone(), signed);
        }
        signatures
    }

    #[tokio::test]
    async fn test_submit_first_try() {
        let h = harness(4);
        let prepared = h.preparer.prepare(start(1), &players()).await.unwrap();
        let signatures = sign_all(&prepared).await;

        let outcome = h.retrier.submit(&prepared, &signatures, &players()).await.unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Landed { .. }));
        assert_eq!(h.ledger.landed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_twice_then_lands_once() {
        let h = harness(4);
        let prepared = h.preparer.prepare(start(2), &players()).await.unwrap();
        let signatures = sign_all(&prepared).await;
        h.ledger.inject_stale_sequences(2).await;

        let outcome = h.retrier.submit(&prepared, &signatures, &players()).await.unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Landed { .. }));
        assert_eq!(h.ledger.submit_attempts().await, 3);
        assert_eq!(h.ledger.landed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_exhausted() {
        let h = harness(3);
        let prepared = h.preparer.prepare(start(3), &players()).await.unwrap();
        let signatures = sign_all(&prepared).await;
        h.ledger.inject_stale_sequences(10).await;

        let err = h.retrier.submit(&prepared, &signatures, &players()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StaleSequence { attempts: 3 }));
        assert_eq!(h.ledger.submit_attempts().await, 3);
        assert!(h.ledger.landed().await.is_empty());
    }

    #[tokio::test]
    async fn test_landed_but_reported_stale() {
        let h = harness(4);
        let prepared = h.preparer.prepare(start(4), &players()).await.unwrap();
        let signatures = sign_all(&prepared).await;
        h.ledger.inject_landed_but_stale(1).await;

        let outcome = h.retrier.submit(&prepared, &signatures, &players()).await.unwrap();
        assert_eq!(outcome, SubmissionOutcome::AlreadyOnChain);
        assert_eq!(h.ledger.submit_attempts().await, 1);
        assert_eq!(h.ledger.landed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_signature_is_stale() {
        let h = harness(4);
        let prepared = h.preparer.prepare(start(5), &players()).await.unwrap();
        let mut signatures = BTreeMap::new();
        for (address, entry) in &prepared.auth_entries {
            let signed = DevWallet::new(address.clone()).sign_auth(entry, prepared.latest_ledger).await.unwrap();
            signatures.insert(address.clone(), signed);
        }

        let err = h.retrier.submit(&prepared, &signatures, &players()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AuthorizationStale { .. }));
        assert_eq!(h.ledger.submit_attempts().await, 0);
    }

    #[tokio::test]
    async fn test_other_ledger_errors_not_retried() {
        let h = harness(4);
        let prepared = h.preparer.prepare(start(6), &players()).await.unwrap();
        let signatures = sign_all(&prepared).await;
        h.ledger.inject_failure("insufficient fee").await;

        let err = h.retrier.submit(&prepared, &signatures, &players()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Ledger(LedgerError::Other(msg)) if msg == "insufficient fee"));
        assert_eq!(h.ledger.submit_attempts().await, 1);
    }

    #[test]
    fn test_assemble_requires_every_signer() {
        let hash = start(7).invocation_hash();
        let placeholder = |name: &str, nonce| AuthEntry::unsigned(Address::new(name), nonce, hash);
        let tx = Transaction {
            source: Address::new("GSERVICE"),
            sequence: 1,
            invocation: start(7),
            auth: vec![placeholder("GALICE", 1), placeholder("GBOB", 2)],
            resource_fee: 0,
        };
        let prepared = PreparedRegistration {
            session_id: SessionId::new(7).unwrap(),
            payload: tx.to_payload().unwrap(),
            auth_entries: tx.auth.iter().map(|e| (e.address.clone(), e.clone())).collect(),
            required_auth_addresses: players(),
            transaction: tx,
            latest_ledger: 1,
            auth_valid_until: 61,
        };

        let mut alice = placeholder("GALICE", 1);
        alice.expiration_ledger = 61;
        alice.signature = Some(vec![1]);
        let signatures: BTreeMap<_, _> = [(Address::new("GALICE"), alice)].into_iter().collect();

        let err = assemble(&prepared, &signatures).unwrap_err();
        assert!(matches!(err, CoordinatorError::AuthorizationStale { address } if address.as_str() == "GBOB"));
    }
}
