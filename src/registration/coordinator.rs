//! Registration Coordinator
//!
//! Per-match state machine for client-signed registration:
//!
//! ```text
//! unprepared ─prepare─► prepared ─auth─► collecting ─quorum─► submitting ─┬─► (removed, match in progress)
//!                          ▲                                             └─► failed ─prepare─┘
//!                          └──────────────── cancel from any non-submitting phase ──► cancelled
//! ```
//!
//! All state lives in the [`PendingStore`]; every transition is a
//! versioned compare-and-swap. The transition into `submitting` sets the
//! `submitted` guard in the same write that records the final signature,
//! so exactly one request ever drives the ledger submission. No lock is
//! held across ledger calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{CoordinatorConfig, RegistrationMode};
use crate::core::ids::{Address, MatchId, SessionId, TxId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::tx::{AuthEntry, Transaction};
use crate::ledger::{EnvelopeSigner, LedgerClient};
use crate::network::notify::{MatchNotification, Notifier};
use crate::registration::allocator::SessionAllocator;
use crate::registration::cancel::{CancelOutcome, CancellationService};
use crate::registration::preparer::{registration_invocation, TransactionPreparer};
use crate::registration::retrier::SubmissionRetrier;
use crate::registration::{PendingRegistration, PreparedRegistration, RegistrationPhase};
use crate::store::{MatchRecord, MatchStatus, MatchStore, PendingStore, StoreError};

/// Upper bound on optimistic retries per operation.
const MAX_CAS_ROUNDS: usize = 16;

/// Reason recorded when the timeout sweep cancels a match.
pub const SIGNATURE_TIMEOUT_REASON: &str = "signature_timeout";

/// Collaborators the coordinator is built from.
pub struct CoordinatorDeps {
    /// Contract platform.
    pub ledger: Arc<dyn LedgerClient>,
    /// Match records.
    pub matches: Arc<dyn MatchStore>,
    /// In-flight registration state.
    pub pending: Arc<dyn PendingStore>,
    /// Outbound events.
    pub notifier: Arc<dyn Notifier>,
    /// Service key.
    pub envelope_signer: Arc<dyn EnvelopeSigner>,
}

/// What a client needs to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationView {
    /// Match.
    pub match_id: MatchId,
    /// Reserved session.
    pub session_id: SessionId,
    /// Encoded transaction; clients cache it for restart recovery.
    pub payload: String,
    /// Unsigned entries, one per required address.
    pub auth_entries: Vec<AuthEntry>,
    /// Addresses that must sign.
    pub required_auth_addresses: Vec<Address>,
    /// Expiration ledger to sign with.
    pub auth_valid_until: u32,
    /// Addresses that already signed.
    pub signed: Vec<Address>,
    /// Current phase.
    pub phase: RegistrationPhase,
}

impl RegistrationView {
    /// Unsigned entry for `address`, if it must sign.
    pub fn entry_for(&self, address: &Address) -> Option<&AuthEntry> {
        self.auth_entries.iter().find(|entry| &entry.address == address)
    }
}

impl From<&PendingRegistration> for RegistrationView {
    fn from(pending: &PendingRegistration) -> Self {
        let prepared = &pending.prepared;
        Self {
            match_id: pending.match_id,
            session_id: prepared.session_id,
            payload: prepared.payload.clone(),
            auth_entries: prepared
                .required_auth_addresses
                .iter()
                .filter_map(|address| prepared.auth_entries.get(address).cloned())
                .collect(),
            required_auth_addresses: prepared.required_auth_addresses.clone(),
            auth_valid_until: prepared.auth_valid_until,
            signed: pending.signed_addresses(),
            phase: pending.phase,
        }
    }
}

/// Result of `prepare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Players must sign.
    AwaitingSignatures(RegistrationView),
    /// Nothing to sign; registration was submitted right away.
    Registered {
        /// Registered session.
        session_id: SessionId,
        /// Transaction id, if known.
        tx_id: Option<TxId>,
    },
}

/// Result of `submit_auth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationProgress {
    /// Recorded; other signatures still missing.
    Waiting {
        /// Addresses signed so far.
        signed: Vec<Address>,
        /// Addresses still missing.
        waiting_for: Vec<Address>,
    },
    /// Another request is already submitting.
    Submitting,
    /// This address does not need to sign.
    NotRequired,
    /// Registered on-chain.
    Complete {
        /// Registered session.
        session_id: SessionId,
        /// Transaction id, if known.
        tx_id: Option<TxId>,
    },
}

/// Coordinates registration of matches.
pub struct RegistrationCoordinator {
    config: CoordinatorConfig,
    matches: Arc<dyn MatchStore>,
    pending: Arc<dyn PendingStore>,
    notifier: Arc<dyn Notifier>,
    allocator: SessionAllocator,
    preparer: Arc<TransactionPreparer>,
    retrier: Arc<SubmissionRetrier>,
    cancellation: CancellationService,
}

impl RegistrationCoordinator {
    /// Wire a coordinator from its collaborators.
    pub fn new(config: CoordinatorConfig, deps: CoordinatorDeps) -> Self {
        let source = deps.envelope_signer.source().clone();
        let preparer = Arc::new(TransactionPreparer::new(
            deps.ledger.clone(),
            source,
            config.auth_validity_ledgers,
        ));
        let retrier = Arc::new(SubmissionRetrier::new(
            deps.ledger.clone(),
            preparer.clone(),
            deps.envelope_signer.clone(),
            config.retry.clone(),
        ));
        let allocator = SessionAllocator::new(
            deps.ledger.clone(),
            deps.matches.clone(),
            config.session_fallback_candidates,
        );
        let cancellation = CancellationService::new(
            deps.matches.clone(),
            deps.pending.clone(),
            deps.notifier.clone(),
            preparer.clone(),
            retrier.clone(),
            config.lobby_redirect.clone(),
        );

        Self {
            config,
            matches: deps.matches,
            pending: deps.pending,
            notifier: deps.notifier,
            allocator,
            preparer,
            retrier,
            cancellation,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Match record store.
    pub fn matches(&self) -> &Arc<dyn MatchStore> {
        &self.matches
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Prepare (or return the already prepared) registration transaction.
    ///
    /// Idempotent while no submission has started. A failed registration is
    /// prepared afresh.
    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn prepare(&self, match_id: &MatchId) -> CoordinatorResult<PrepareOutcome> {
        for _ in 0..MAX_CAS_ROUNDS {
            let record = self.load_record(match_id).await?;
            match record.status {
                MatchStatus::InProgress | MatchStatus::Completed => {
                    return Err(CoordinatorError::AlreadySubmitted(*match_id))
                }
                MatchStatus::Cancelled => return Err(cancelled(match_id)),
                MatchStatus::Created | MatchStatus::Registering => {}
            }

            let existing = self.pending.load(match_id).await?;
            let expected = match &existing {
                None => None,
                Some(current) => match current.value.phase {
                    RegistrationPhase::Prepared | RegistrationPhase::Collecting => {
                        debug!("returning cached registration");
                        return Ok(PrepareOutcome::AwaitingSignatures(RegistrationView::from(&current.value)));
                    }
                    RegistrationPhase::Submitting => return Err(CoordinatorError::AlreadySubmitted(*match_id)),
                    RegistrationPhase::Cancelled => return Err(cancelled(match_id)),
                    RegistrationPhase::Failed => Some(current.version),
                },
            };

            let session_id = self.allocator.allocate_and_reserve(match_id).await?;
            let signers = self.signers(&record.player1, &record.player2);
            let prepared = self
                .preparer
                .prepare(registration_invocation(&record, session_id), &signers)
                .await?;
            let payload = prepared.payload.clone();

            let mut fresh = PendingRegistration::new(*match_id, prepared, record.player1.clone(), record.player2.clone());
            let immediate = fresh.has_quorum();
            if immediate {
                fresh.submitted = true;
                fresh.phase = RegistrationPhase::Submitting;
            }

            match self.pending.store(match_id, expected, fresh.clone()).await {
                Ok(_) => {}
                Err(StoreError::VersionConflict) => {
                    debug!("concurrent prepare won; re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            self.matches.set_status(match_id, MatchStatus::Registering).await?;
            self.matches.remember_payload(match_id, Some(payload)).await?;
            info!(
                session_id = %session_id,
                required = fresh.prepared.required_auth_addresses.len(),
                auth_valid_until = fresh.prepared.auth_valid_until,
                "registration prepared"
            );

            if immediate {
                let (session_id, tx_id) = self.run_submission(match_id, fresh).await?;
                return Ok(PrepareOutcome::Registered { session_id, tx_id });
            }
            return Ok(PrepareOutcome::AwaitingSignatures(RegistrationView::from(&fresh)));
        }

        Err(CoordinatorError::Contention(*match_id))
    }

    /// Record `address`'s signed authorization; submit once all are in.
    ///
    /// `cached_payload` is the payload the client received from `prepare`;
    /// it lets the registration resume if this process lost its pending
    /// state.
    #[instrument(skip(self, signed, cached_payload), fields(match_id = %match_id, address = %address.short()))]
    pub async fn submit_auth(
        &self,
        match_id: &MatchId,
        address: &Address,
        signed: AuthEntry,
        cached_payload: Option<&str>,
    ) -> CoordinatorResult<RegistrationProgress> {
        let record = self.load_record(match_id).await?;
        if !record.is_participant(address) || &signed.address != address {
            warn!("authorization from non-participant");
            return Err(CoordinatorError::Forbidden { match_id: *match_id, address: address.clone() });
        }
        if let Some(done) = registered(&record)? {
            return Ok(done);
        }
        if record.status == MatchStatus::Cancelled {
            return Err(cancelled(match_id));
        }

        for _ in 0..MAX_CAS_ROUNDS {
            let (expected, mut pending) = match self.pending.load(match_id).await? {
                Some(current) => (Some(current.version), current.value),
                None => {
                    // Either the registration just finished or this process
                    // lost its state.
                    let record = self.load_record(match_id).await?;
                    if let Some(done) = registered(&record)? {
                        return Ok(done);
                    }
                    (None, self.recover(&record, cached_payload)?)
                }
            };

            match pending.phase {
                RegistrationPhase::Prepared | RegistrationPhase::Collecting => {}
                RegistrationPhase::Submitting => return Ok(RegistrationProgress::Submitting),
                RegistrationPhase::Cancelled => return Err(cancelled(match_id)),
                RegistrationPhase::Failed => {
                    return Err(CoordinatorError::AuthorizationStale { address: address.clone() })
                }
            }

            if !pending.prepared.required_auth_addresses.contains(address) {
                debug!("address does not need to sign");
                return Ok(RegistrationProgress::NotRequired);
            }
            let placeholder = pending
                .prepared
                .auth_entries
                .get(address)
                .ok_or_else(|| CoordinatorError::AuthorizationStale { address: address.clone() })?;
            if !signed.can_replace(placeholder, pending.prepared.latest_ledger) {
                warn!("authorization does not fit the prepared transaction");
                return Err(CoordinatorError::AuthorizationStale { address: address.clone() });
            }

            if pending.signatures.get(address) == Some(&signed) {
                return Ok(RegistrationProgress::Waiting {
                    signed: pending.signed_addresses(),
                    waiting_for: pending.missing_addresses(),
                });
            }

            pending.signatures.insert(address.clone(), signed.clone());
            let quorum = pending.has_quorum();
            if quorum {
                pending.submitted = true;
                pending.phase = RegistrationPhase::Submitting;
            } else {
                pending.phase = RegistrationPhase::Collecting;
            }

            match self.pending.store(match_id, expected, pending.clone()).await {
                Ok(_) => {}
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }

            let signed_so_far = pending.signed_addresses();
            let waiting_for = pending.missing_addresses();
            self.notifier.publish(*match_id, MatchNotification::RegistrationAuthReceived {
                address: address.clone(),
                signed: signed_so_far.clone(),
                waiting_for: waiting_for.clone(),
            });

            if !quorum {
                info!(waiting = waiting_for.len(), "authorization recorded");
                return Ok(RegistrationProgress::Waiting { signed: signed_so_far, waiting_for });
            }

            info!("all authorizations collected; submitting");
            let (session_id, tx_id) = self.run_submission(match_id, pending).await?;
            return Ok(RegistrationProgress::Complete { session_id, tx_id });
        }

        Err(CoordinatorError::Contention(*match_id))
    }

    /// Cancel a match, or defer the cancel if a submission is in flight.
    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn cancel(&self, match_id: &MatchId, reason: &str) -> CoordinatorResult<CancelOutcome> {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.pending.load(match_id).await? else {
                return self.cancellation.cancel(match_id, reason).await;
            };
            let mut value = current.value;

            if value.submitted {
                if value.cancel_requested.is_some() {
                    return Ok(CancelOutcome::Deferred);
                }
                value.cancel_requested = Some(reason.to_string());
                match self.pending.store(match_id, Some(current.version), value).await {
                    Ok(_) => {
                        info!(reason, "submission in flight; cancel deferred");
                        return Ok(CancelOutcome::Deferred);
                    }
                    Err(StoreError::VersionConflict) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let previous = value.phase;
            if previous != RegistrationPhase::Cancelled {
                // Block further signatures before touching the ledger.
                value.phase = RegistrationPhase::Cancelled;
                match self.pending.store(match_id, Some(current.version), value).await {
                    Ok(_) => {}
                    Err(StoreError::VersionConflict) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let result = self.cancellation.cancel(match_id, reason).await;
            if let Err(e) = &result {
                warn!(error = %e, "cancel failed; reopening registration");
                if previous != RegistrationPhase::Cancelled {
                    if let Err(reopen) = self.reopen_after_failed_cancel(match_id, previous).await {
                        error!(error = %reopen, "registration left blocked after failed cancel");
                    }
                }
            }
            return result;
        }

        Err(CoordinatorError::Contention(*match_id))
    }

    /// Current registration view, if one is pending.
    pub async fn view(&self, match_id: &MatchId) -> CoordinatorResult<Option<RegistrationView>> {
        Ok(self.pending.load(match_id).await?.map(|current| RegistrationView::from(&current.value)))
    }

    /// Matches whose signature collection has outlived the timeout.
    pub async fn expired(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<MatchId>> {
        let timeout = self.config.signature_timeout;
        Ok(self
            .pending
            .list()
            .await?
            .into_iter()
            .map(|current| current.value)
            .filter(|pending| !pending.submitted && pending.phase != RegistrationPhase::Cancelled)
            .filter(|pending| {
                now.signed_duration_since(pending.prepared_at)
                    .to_std()
                    .map(|age| age > timeout)
                    .unwrap_or(false)
            })
            .map(|pending| pending.match_id)
            .collect())
    }

    /// Cancel every expired registration. Returns the matches cancelled.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<MatchId>> {
        let mut cancelled = Vec::new();
        for match_id in self.expired(now).await? {
            match self.cancel(&match_id, SIGNATURE_TIMEOUT_REASON).await {
                Ok(CancelOutcome::Cancelled { .. }) => cancelled.push(match_id),
                Ok(other) => debug!(match_id = %match_id, outcome = ?other, "timeout cancel not applied"),
                Err(e) => error!(match_id = %match_id, error = %e, "timeout cancel failed"),
            }
        }
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "cancelled registrations past signature timeout");
        }
        Ok(cancelled)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn load_record(&self, match_id: &MatchId) -> CoordinatorResult<MatchRecord> {
        self.matches
            .get(match_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("match {}", match_id)))
    }

    /// Addresses the preparer may ask to sign.
    fn signers(&self, player1: &Address, player2: &Address) -> Vec<Address> {
        match self.config.mode {
            RegistrationMode::ClientSigned => vec![player1.clone(), player2.clone()],
            RegistrationMode::ServiceOnly => Vec::new(),
        }
    }

    /// Rebuild pending state from a payload the client cached (or the one
    /// persisted on the match record).
    fn recover(&self, record: &MatchRecord, cached_payload: Option<&str>) -> CoordinatorResult<PendingRegistration> {
        let payload = cached_payload
            .map(str::to_string)
            .or_else(|| record.registration_payload.clone())
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!("no pending registration for match {}", record.match_id))
            })?;
        let transaction = Transaction::from_payload(&payload)?;

        let session_id = transaction.invocation.session_id();
        if record.session_id != Some(session_id)
            || transaction.invocation != registration_invocation(record, session_id)
        {
            return Err(CoordinatorError::NotFound(format!(
                "payload does not belong to match {}",
                record.match_id
            )));
        }

        let signers = self.signers(&record.player1, &record.player2);
        let entries: Vec<AuthEntry> = transaction
            .auth
            .iter()
            .filter(|entry| signers.contains(&entry.address))
            .cloned()
            .collect();
        let prepared = PreparedRegistration {
            session_id,
            payload,
            required_auth_addresses: entries.iter().map(|e| e.address.clone()).collect(),
            auth_entries: entries.into_iter().map(|e| (e.address.clone(), e)).collect(),
            transaction,
            latest_ledger: 0,
            auth_valid_until: 0,
        };

        warn!(match_id = %record.match_id, session_id = %session_id, "rebuilt pending registration from payload");
        let mut pending =
            PendingRegistration::new(record.match_id, prepared, record.player1.clone(), record.player2.clone());
        pending.phase = RegistrationPhase::Collecting;
        Ok(pending)
    }

    /// Undo the `Cancelled` phase set by a cancel that did not go through,
    /// so signing and the timeout sweep see the registration again.
    async fn reopen_after_failed_cancel(&self, match_id: &MatchId, phase: RegistrationPhase) -> CoordinatorResult<()> {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.pending.load(match_id).await? else {
                return Ok(());
            };
            let mut value = current.value;
            if value.phase != RegistrationPhase::Cancelled {
                return Ok(());
            }
            value.phase = phase;
            match self.pending.store(match_id, Some(current.version), value).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoordinatorError::Contention(*match_id))
    }

    /// Drive the ledger submission for a snapshot that holds the guard.
    async fn run_submission(
        &self,
        match_id: &MatchId,
        snapshot: PendingRegistration,
    ) -> CoordinatorResult<(SessionId, Option<TxId>)> {
        let signers = self.signers(&snapshot.player1, &snapshot.player2);
        let session_id = snapshot.prepared.session_id;

        match self.retrier.submit(&snapshot.prepared, &snapshot.signatures, &signers).await {
            Ok(outcome) => {
                let tx_id = outcome.tx_id();
                self.matches.record_registration(match_id, session_id, tx_id.clone()).await?;
                let deferred = self.finish_pending(match_id).await?;

                info!(session_id = %session_id, tx_id = ?tx_id, "registration complete");
                self.notifier.publish(*match_id, MatchNotification::RegistrationComplete {
                    session_id,
                    tx_id: tx_id.clone(),
                });

                if let Some(reason) = deferred {
                    self.run_deferred_cancel(match_id, &reason).await;
                }
                Ok((session_id, tx_id))
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, code = e.code(), "registration submission failed");
                let deferred = self.reset_after_failure(match_id).await?;
                self.notifier.publish(*match_id, MatchNotification::RegistrationFailed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });

                if let Some(reason) = deferred {
                    self.run_deferred_cancel(match_id, &reason).await;
                }
                Err(e)
            }
        }
    }

    /// Delete pending state after success. Returns a deferred cancel reason.
    async fn finish_pending(&self, match_id: &MatchId) -> CoordinatorResult<Option<String>> {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.pending.load(match_id).await? else {
                return Ok(None);
            };
            match self.pending.remove(match_id, current.version).await {
                Ok(()) => return Ok(current.value.cancel_requested),
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoordinatorError::Contention(*match_id))
    }

    /// Release the guard and drop signatures after a failed submission.
    /// Returns a deferred cancel reason.
    async fn reset_after_failure(&self, match_id: &MatchId) -> CoordinatorResult<Option<String>> {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.pending.load(match_id).await? else {
                return Ok(None);
            };
            let mut value = current.value;
            let deferred = value.cancel_requested.take();
            value.submitted = false;
            value.signatures.clear();
            value.phase = RegistrationPhase::Failed;
            match self.pending.store(match_id, Some(current.version), value).await {
                Ok(_) => return Ok(deferred),
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoordinatorError::Contention(*match_id))
    }

    async fn run_deferred_cancel(&self, match_id: &MatchId, reason: &str) {
        info!(match_id = %match_id, reason, "running deferred cancel");
        if let Err(e) = self.cancel(match_id, reason).await {
            error!(match_id = %match_id, error = %e, "deferred cancel failed");
        }
    }
}

fn cancelled(match_id: &MatchId) -> CoordinatorError {
    CoordinatorError::NotFound(format!("match {} was cancelled", match_id))
}

/// Completion result if the record shows the match registered.
fn registered(record: &MatchRecord) -> CoordinatorResult<Option<RegistrationProgress>> {
    match record.status {
        MatchStatus::InProgress | MatchStatus::Completed => {
            let session_id = record.session_id.ok_or_else(|| {
                CoordinatorError::NotFound(format!("session for match {}", record.match_id))
            })?;
            Ok(Some(RegistrationProgress::Complete {
                session_id,
                tx_id: record.registration_tx.clone(),
            }))
        }
        _ => Ok(None),
    }
}
