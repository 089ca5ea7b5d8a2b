//! In-Memory Ledger
//!
//! A single-process stand-in for the contract platform, used by tests
//! and by the `demo`/`serve` binary modes. It enforces the rules the
//! coordinator has to cope with:
//! - source account sequence numbers must match exactly
//! - every required authorization must be signed, unexpired and unused
//! - cancelling an unknown session is `NotFound`
//!
//! Faults can be injected to reproduce stale sequences, submissions that
//! land but report failure, and simulations without authorization data.
//!
//! Signatures are deterministic hashes ("dev keys"): anyone can produce
//! them. Development only.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::hash::{hash_with_domain, Hash32};
use crate::core::ids::{Address, SessionId, TxId};
use crate::ledger::signer::{EnvelopeSigner, Wallet};
use crate::ledger::tx::{AuthEntry, Invocation, OnChainMatch, SignedEnvelope, Simulation, Transaction};
use crate::ledger::{LedgerClient, LedgerError};

/// Base resource fee charged by simulation.
const BASE_RESOURCE_FEE: u64 = 100;

/// Additional fee per authorization entry.
const AUTH_RESOURCE_FEE: u64 = 10;

/// Produce the dev-key signature of `address` over `digest`.
pub fn dev_signature(address: &Address, digest: &Hash32) -> Vec<u8> {
    let mut data = Vec::with_capacity(address.as_str().len() + digest.len());
    data.extend_from_slice(address.as_str().as_bytes());
    data.extend_from_slice(digest);
    hash_with_domain(b"DUEL_DEV_KEY_V1", &data).to_vec()
}

/// Injected failures, consumed one per submission.
#[derive(Debug, Default)]
struct Faults {
    /// Reject with `StaleSequence` before applying.
    stale_submits: u32,
    /// Apply, then report `StaleSequence` anyway.
    landed_but_stale: u32,
    /// Return simulations without authorization data.
    omit_auth: u32,
    /// Reject with `Other` before applying.
    other_failures: Vec<String>,
}

#[derive(Debug, Default)]
struct LedgerState {
    latest_ledger: u32,
    sequences: BTreeMap<Address, u64>,
    matches: BTreeMap<SessionId, OnChainMatch>,
    consumed_nonces: BTreeSet<(Address, u64)>,
    next_nonce: u64,
    landed: Vec<TxId>,
    submit_attempts: u32,
    faults: Faults,
}

impl LedgerState {
    fn tick(&mut self) -> u32 {
        self.latest_ledger += 1;
        self.latest_ledger
    }

    fn next_sequence(&self, source: &Address) -> u64 {
        self.sequences.get(source).copied().unwrap_or(0) + 1
    }

    /// Addresses the invocation's execution plan needs, beyond the source.
    fn required_signers(&self, invocation: &Invocation) -> Result<Vec<Address>, LedgerError> {
        match invocation {
            Invocation::StartMatch { session_id, player1, player2, player1_points, player2_points } => {
                if player1 == player2 {
                    return Err(LedgerError::Other("cannot play against yourself".into()));
                }
                match self.matches.get(session_id) {
                    None => Ok(vec![player1.clone(), player2.clone()]),
                    Some(existing)
                        if &existing.player1 == player1
                            && &existing.player2 == player2
                            && existing.player1_points == *player1_points
                            && existing.player2_points == *player2_points =>
                    {
                        // Re-registration of an identical match is a no-op.
                        Ok(Vec::new())
                    }
                    Some(_) => Err(LedgerError::Other(format!(
                        "session {} already registered to other players",
                        session_id
                    ))),
                }
            }
            Invocation::CancelMatch { session_id } => {
                if self.matches.contains_key(session_id) {
                    Ok(Vec::new())
                } else {
                    Err(LedgerError::NotFound(format!("no match for session {}", session_id)))
                }
            }
        }
    }

    fn check_auth(&self, tx: &Transaction, required: &[Address]) -> Result<(), LedgerError> {
        let expected_hash = tx.invocation.invocation_hash();
        for address in required {
            let entry = tx
                .auth_slot(address)
                .ok_or_else(|| LedgerError::Other(format!("missing authorization for {}", address)))?;
            let signature = entry
                .signature
                .as_ref()
                .ok_or_else(|| LedgerError::Other(format!("unsigned authorization for {}", address)))?;
            if entry.invocation_hash != expected_hash {
                return Err(LedgerError::Other(format!("authorization for {} covers another invocation", address)));
            }
            if entry.expiration_ledger < self.latest_ledger {
                return Err(LedgerError::Other(format!("authorization for {} expired", address)));
            }
            if self.consumed_nonces.contains(&(address.clone(), entry.nonce)) {
                return Err(LedgerError::Other(format!("authorization nonce for {} already used", address)));
            }
            if signature != &dev_signature(address, &entry.signing_digest()) {
                return Err(LedgerError::Other(format!("bad authorization signature for {}", address)));
            }
        }
        Ok(())
    }

    fn apply(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        match &tx.invocation {
            Invocation::StartMatch { session_id, player1, player2, player1_points, player2_points } => {
                self.matches.entry(*session_id).or_insert_with(|| OnChainMatch {
                    player1: player1.clone(),
                    player2: player2.clone(),
                    player1_points: *player1_points,
                    player2_points: *player2_points,
                });
            }
            Invocation::CancelMatch { session_id } => {
                if self.matches.remove(session_id).is_none() {
                    return Err(LedgerError::NotFound(format!("no match for session {}", session_id)));
                }
            }
        }
        for entry in &tx.auth {
            self.consumed_nonces.insert((entry.address.clone(), entry.nonce));
        }
        *self.sequences.entry(tx.source.clone()).or_insert(0) = tx.sequence;
        Ok(())
    }
}

/// In-process ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` submissions with `StaleSequence`.
    ///
    /// Each rejection also advances the source account, the way a
    /// competing transaction from the same account would.
    pub async fn inject_stale_sequences(&self, count: u32) {
        self.state.lock().await.faults.stale_submits += count;
    }

    /// Apply the next `count` submissions but report `StaleSequence`.
    pub async fn inject_landed_but_stale(&self, count: u32) {
        self.state.lock().await.faults.landed_but_stale += count;
    }

    /// Omit authorization data from the next `count` simulations.
    pub async fn inject_missing_auth(&self, count: u32) {
        self.state.lock().await.faults.omit_auth += count;
    }

    /// Reject the next submission with `Other(message)`.
    pub async fn inject_failure(&self, message: impl Into<String>) {
        self.state.lock().await.faults.other_failures.push(message.into());
    }

    /// Seed on-chain match state directly.
    pub async fn insert_match(&self, session_id: SessionId, record: OnChainMatch) {
        self.state.lock().await.matches.insert(session_id, record);
    }

    /// Advance an account's sequence, as an unrelated transaction would.
    pub async fn bump_sequence(&self, source: &Address) {
        let mut state = self.state.lock().await;
        *state.sequences.entry(source.clone()).or_insert(0) += 1;
    }

    /// Advance the ledger height.
    pub async fn advance_ledgers(&self, count: u32) {
        self.state.lock().await.latest_ledger += count;
    }

    /// Transactions that were applied.
    pub async fn landed(&self) -> Vec<TxId> {
        self.state.lock().await.landed.clone()
    }

    /// Number of `submit` calls seen.
    pub async fn submit_attempts(&self) -> u32 {
        self.state.lock().await.submit_attempts
    }

    /// Number of sessions with on-chain state.
    pub async fn match_count(&self) -> usize {
        self.state.lock().await.matches.len()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn simulate(
        &self,
        source: &Address,
        invocation: &Invocation,
    ) -> Result<Simulation, LedgerError> {
        let mut state = self.state.lock().await;
        let latest_ledger = state.tick();
        let signers = state.required_signers(invocation)?;
        let invocation_hash = invocation.invocation_hash();

        let auth: Vec<AuthEntry> = signers
            .into_iter()
            .map(|address| {
                state.next_nonce += 1;
                AuthEntry::unsigned(address, state.next_nonce, invocation_hash)
            })
            .collect();

        let transaction = Transaction {
            source: source.clone(),
            sequence: state.next_sequence(source),
            invocation: invocation.clone(),
            auth: auth.clone(),
            resource_fee: BASE_RESOURCE_FEE + AUTH_RESOURCE_FEE * auth.len() as u64,
        };

        let required_auth = if state.faults.omit_auth > 0 {
            state.faults.omit_auth -= 1;
            None
        } else {
            Some(auth)
        };

        debug!(
            invocation = invocation.name(),
            session_id = %invocation.session_id(),
            sequence = transaction.sequence,
            latest_ledger,
            "simulated invocation"
        );

        Ok(Simulation { transaction, required_auth, latest_ledger })
    }

    async fn simulate_transaction(&self, tx: &Transaction) -> Result<Transaction, LedgerError> {
        let mut state = self.state.lock().await;
        state.tick();
        let mut refreshed = tx.clone();
        // Signed entries carry a signature payload, which costs more to verify.
        let signed = tx.auth.iter().filter(|entry| entry.is_signed()).count() as u64;
        refreshed.resource_fee =
            BASE_RESOURCE_FEE + AUTH_RESOURCE_FEE * tx.auth.len() as u64 + AUTH_RESOURCE_FEE * signed;
        Ok(refreshed)
    }

    async fn submit(&self, envelope: &SignedEnvelope) -> Result<TxId, LedgerError> {
        let mut state = self.state.lock().await;
        state.submit_attempts += 1;
        state.tick();

        let tx = &envelope.transaction;
        if envelope.signature != dev_signature(&tx.source, &tx.hash()) {
            return Err(LedgerError::Other("bad envelope signature".into()));
        }

        if state.faults.stale_submits > 0 {
            state.faults.stale_submits -= 1;
            *state.sequences.entry(tx.source.clone()).or_insert(0) += 1;
            return Err(LedgerError::StaleSequence);
        }
        if !state.faults.other_failures.is_empty() {
            let message = state.faults.other_failures.remove(0);
            return Err(LedgerError::Other(message));
        }

        if tx.sequence != state.next_sequence(&tx.source) {
            return Err(LedgerError::StaleSequence);
        }

        let required = match &tx.invocation {
            // Cancellation of a missing session is reported by `apply`.
            Invocation::CancelMatch { .. } => Vec::new(),
            invocation => state.required_signers(invocation)?,
        };
        state.check_auth(tx, &required)?;
        state.apply(tx)?;

        let tx_id = tx.tx_id();
        state.landed.push(tx_id.clone());

        if state.faults.landed_but_stale > 0 {
            state.faults.landed_but_stale -= 1;
            return Err(LedgerError::StaleSequence);
        }

        Ok(tx_id)
    }

    async fn query_state(&self, session_id: SessionId) -> Result<Option<OnChainMatch>, LedgerError> {
        Ok(self.state.lock().await.matches.get(&session_id).cloned())
    }
}

/// Wallet signing with a dev key.
#[derive(Debug, Clone)]
pub struct DevWallet {
    address: Address,
}

impl DevWallet {
    /// Wallet for `address`.
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Wallet for DevWallet {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn sign_auth(
        &self,
        entry: &AuthEntry,
        valid_until_ledger: u32,
    ) -> Result<AuthEntry, LedgerError> {
        if entry.address != self.address {
            return Err(LedgerError::NoSignatureNeeded);
        }
        let mut signed = entry.clone();
        signed.expiration_ledger = valid_until_ledger;
        signed.signature = Some(dev_signature(&self.address, &signed.signing_digest()));
        Ok(signed)
    }
}

/// Envelope signer with a dev key.
#[derive(Debug, Clone)]
pub struct DevEnvelopeSigner {
    source: Address,
}

impl DevEnvelopeSigner {
    /// Signer for the `source` account.
    pub fn new(source: Address) -> Self {
        Self { source }
    }
}

impl EnvelopeSigner for DevEnvelopeSigner {
    fn source(&self) -> &Address {
        &self.source
    }

    fn sign_envelope(&self, tx: Transaction) -> SignedEnvelope {
        let signature = dev_signature(&self.source, &tx.hash());
        SignedEnvelope { transaction: tx, signature }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Address {
        Address::new("GSERVICE")
    }

    fn start(session: u32) -> Invocation {
        Invocation::StartMatch {
            session_id: SessionId::new(session).unwrap(),
            player1: Address::new("GALICE"),
            player2: Address::new("GBOB"),
            player1_points: 10,
            player2_points: 10,
        }
    }

    async fn signed_start(ledger: &InMemoryLedger, session: u32) -> SignedEnvelope {
        let sim = ledger.simulate(&service(), &start(session)).await.unwrap();
        let mut tx = sim.transaction.clone();
        for entry in sim.required_auth.unwrap() {
            let wallet = DevWallet::new(entry.address.clone());
            let signed = wallet.sign_auth(&entry, sim.latest_ledger + 50).await.unwrap();
            assert!(tx.inject(signed));
        }
        DevEnvelopeSigner::new(service()).sign_envelope(tx)
    }

    #[tokio::test]
    async fn test_simulate_requires_both_players() {
        let ledger = InMemoryLedger::new();
        let sim = ledger.simulate(&service(), &start(1)).await.unwrap();
        let required = sim.required_auth.unwrap();
        assert_eq!(required.len(), 2);
        assert_eq!(sim.transaction.sequence, 1);
        assert_ne!(required[0].nonce, required[1].nonce);
    }

    #[tokio::test]
    async fn test_submit_lands_and_consumes_sequence() {
        let ledger = InMemoryLedger::new();
        let envelope = signed_start(&ledger, 5).await;

        ledger.submit(&envelope).await.unwrap();
        assert!(ledger.query_state(SessionId::new(5).unwrap()).await.unwrap().is_some());

        // Same envelope again: its sequence is now stale.
        assert_eq!(ledger.submit(&envelope).await, Err(LedgerError::StaleSequence));
        assert_eq!(ledger.landed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unsigned_auth_rejected() {
        let ledger = InMemoryLedger::new();
        let sim = ledger.simulate(&service(), &start(2)).await.unwrap();
        let envelope = DevEnvelopeSigner::new(service()).sign_envelope(sim.transaction);

        let result = ledger.submit(&envelope).await;
        assert!(matches!(result, Err(LedgerError::Other(_))));
    }

    #[tokio::test]
    async fn test_wallet_refuses_foreign_entry() {
        let ledger = InMemoryLedger::new();
        let sim = ledger.simulate(&service(), &start(3)).await.unwrap();
        let entry = &sim.required_auth.unwrap()[0];

        let wallet = DevWallet::new(Address::new("GSOMEONEELSE"));
        assert_eq!(wallet.sign_auth(entry, 10).await, Err(LedgerError::NoSignatureNeeded));
    }

    #[tokio::test]
    async fn test_cancel_missing_session_not_found() {
        let ledger = InMemoryLedger::new();
        let cancel = Invocation::CancelMatch { session_id: SessionId::new(9).unwrap() };
        assert!(matches!(
            ledger.simulate(&service(), &cancel).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reregistration_needs_no_auth() {
        let ledger = InMemoryLedger::new();
        let envelope = signed_start(&ledger, 4).await;
        ledger.submit(&envelope).await.unwrap();

        let sim = ledger.simulate(&service(), &start(4)).await.unwrap();
        assert_eq!(sim.required_auth.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let ledger = InMemoryLedger::new();
        ledger.inject_missing_auth(1).await;
        let sim = ledger.simulate(&service(), &start(6)).await.unwrap();
        assert!(sim.required_auth.is_none());

        ledger.inject_landed_but_stale(1).await;
        let envelope = signed_start(&ledger, 6).await;
        assert_eq!(ledger.submit(&envelope).await, Err(LedgerError::StaleSequence));
        assert_eq!(ledger.match_count().await, 1);
    }
}
