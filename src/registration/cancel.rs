//! Match Cancellation
//!
//! Reverses whatever a match managed to put on-chain, then marks it
//! cancelled and tells both clients where to go. The on-chain step is best
//! effort unless stake is locked: with a confirmed deposit, a cancellation
//! we cannot confirm is an error, never a silent success.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::core::ids::{MatchId, SessionId, TxId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::tx::Invocation;
use crate::ledger::LedgerError;
use crate::network::notify::{MatchNotification, Notifier};
use crate::registration::preparer::TransactionPreparer;
use crate::registration::retrier::SubmissionRetrier;
use crate::store::{MatchStatus, MatchStore, PendingStore, StoreError};

/// Upper bound on optimistic retries when clearing pending state.
const MAX_CAS_ROUNDS: usize = 16;

/// What happened on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnChainCancel {
    /// No session was ever reserved.
    NotRegistered,
    /// The ledger has no state for the session.
    NothingToCancel,
    /// Cancellation landed (or the session was already gone afterwards).
    Confirmed {
        /// Transaction id, if known.
        tx_id: Option<TxId>,
    },
    /// Could not be confirmed; no stake was at risk.
    Unconfirmed {
        /// Underlying failure.
        reason: String,
    },
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Match cancelled.
    Cancelled {
        /// On-chain side.
        on_chain: OnChainCancel,
    },
    /// A submission is in flight; the cancel runs once it resolves.
    Deferred,
    /// Match was already cancelled.
    AlreadyCancelled,
}

/// Performs cancellations.
pub struct CancellationService {
    matches: Arc<dyn MatchStore>,
    pending: Arc<dyn PendingStore>,
    notifier: Arc<dyn Notifier>,
    preparer: Arc<TransactionPreparer>,
    retrier: Arc<SubmissionRetrier>,
    lobby_redirect: String,
}

impl CancellationService {
    /// Create the service.
    pub fn new(
        matches: Arc<dyn MatchStore>,
        pending: Arc<dyn PendingStore>,
        notifier: Arc<dyn Notifier>,
        preparer: Arc<TransactionPreparer>,
        retrier: Arc<SubmissionRetrier>,
        lobby_redirect: impl Into<String>,
    ) -> Self {
        Self {
            matches,
            pending,
            notifier,
            preparer,
            retrier,
            lobby_redirect: lobby_redirect.into(),
        }
    }

    /// Cancel `match_id` now.
    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn cancel(&self, match_id: &MatchId, reason: &str) -> CoordinatorResult<CancelOutcome> {
        let record = self
            .matches
            .get(match_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("match {}", match_id)))?;

        match record.status {
            MatchStatus::Cancelled => return Ok(CancelOutcome::AlreadyCancelled),
            MatchStatus::Completed => {
                return Err(CoordinatorError::NotFound(format!("match {} already completed", match_id)))
            }
            _ => {}
        }

        let on_chain = match record.session_id {
            None => OnChainCancel::NotRegistered,
            Some(session_id) => match self.cancel_on_chain(session_id).await {
                Ok(outcome) => outcome,
                Err(e) if record.has_confirmed_stake() => {
                    error!(session_id = %session_id, error = %e, "on-chain cancellation unconfirmed with stake locked");
                    return Err(CoordinatorError::CancellationUnconfirmed {
                        match_id: *match_id,
                        session_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "best-effort on-chain cancellation failed");
                    OnChainCancel::Unconfirmed { reason: e.to_string() }
                }
            },
        };

        self.matches.set_status(match_id, MatchStatus::Cancelled).await?;
        self.matches.remember_payload(match_id, None).await?;
        self.clear_pending(match_id).await?;

        info!(reason, on_chain = ?on_chain, "match cancelled");
        self.notifier.publish(*match_id, MatchNotification::MatchCancelled {
            reason: reason.to_string(),
            redirect_to: self.lobby_redirect.clone(),
        });

        Ok(CancelOutcome::Cancelled { on_chain })
    }

    async fn cancel_on_chain(&self, session_id: SessionId) -> CoordinatorResult<OnChainCancel> {
        let invocation = Invocation::CancelMatch { session_id };
        let prepared = match self.preparer.prepare(invocation, &[]).await {
            Ok(prepared) => prepared,
            Err(CoordinatorError::Ledger(LedgerError::NotFound(_))) => return Ok(OnChainCancel::NothingToCancel),
            Err(e) => return Err(e),
        };

        match self.retrier.submit(&prepared, &BTreeMap::new(), &[]).await {
            Ok(outcome) => Ok(OnChainCancel::Confirmed { tx_id: outcome.tx_id() }),
            Err(CoordinatorError::Ledger(LedgerError::NotFound(_))) => Ok(OnChainCancel::NothingToCancel),
            Err(e) => Err(e),
        }
    }

    async fn clear_pending(&self, match_id: &MatchId) -> CoordinatorResult<()> {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.pending.load(match_id).await? else {
                return Ok(());
            };
            match self.pending.remove(match_id, current.version).await {
                Ok(()) => return Ok(()),
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoordinatorError::Contention(*match_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::core::ids::Address;
    use crate::ledger::{DevEnvelopeSigner, InMemoryLedger, LedgerClient, OnChainMatch};
    use crate::network::notify::BroadcastNotifier;
    use crate::store::{InMemoryMatchStore, InMemoryPendingStore, MatchRecord};

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        matches: Arc<InMemoryMatchStore>,
        notifier: Arc<BroadcastNotifier>,
        service: CancellationService,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let pending = Arc::new(InMemoryPendingStore::new());
        let notifier = Arc::new(BroadcastNotifier::new());
        let source = Address::new("GSERVICE");
        let preparer = Arc::new(TransactionPreparer::new(ledger.clone(), source.clone(), 60));
        let retrier = Arc::new(SubmissionRetrier::new(
            ledger.clone(),
            preparer.clone(),
            Arc::new(DevEnvelopeSigner::new(source)),
            RetryConfig::immediate(2),
        ));
        let service = CancellationService::new(
            matches.clone(),
            pending,
            notifier.clone(),
            preparer,
            retrier,
            "/play",
        );
        Harness { ledger, matches, notifier, service }
    }

    async fn staked_match(h: &Harness, session: u32) -> (MatchId, SessionId) {
        let record = MatchRecord::new(MatchId::new_v4(), Address::new("GALICE"), Address::new("GBOB")).with_stake(50);
        let id = record.match_id;
        h.matches.insert(record).await.unwrap();
        let session = SessionId::new(session).unwrap();
        h.matches.reserve_session(&id, session).await.unwrap();
        h.matches.confirm_stake(&id, &Address::new("GALICE")).await.unwrap();
        (id, session)
    }

    fn on_chain() -> OnChainMatch {
        OnChainMatch {
            player1: Address::new("GALICE"),
            player2: Address::new("GBOB"),
            player1_points: 50,
            player2_points: 50,
        }
    }

    #[tokio::test]
    async fn test_stake_confirmed_but_nothing_on_chain() {
        let h = harness();
        let (id, _) = staked_match(&h, 11).await;
        let mut rx = h.notifier.subscribe(id);

        let outcome = h.service.cancel(&id, "signature_timeout").await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled { on_chain: OnChainCancel::NothingToCancel });

        let record = h.matches.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, MatchStatus::Cancelled);
        match rx.recv().await.unwrap() {
            MatchNotification::MatchCancelled { reason, redirect_to } => {
                assert_eq!(reason, "signature_timeout");
                assert_eq!(redirect_to, "/play");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registered_match_is_reversed() {
        let h = harness();
        let (id, session) = staked_match(&h, 12).await;
        h.ledger.insert_match(session, on_chain()).await;

        let outcome = h.service.cancel(&id, "player_left").await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled { on_chain: OnChainCancel::Confirmed { tx_id: Some(_) } }));
        assert!(h.ledger.query_state(session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unconfirmed_with_stake_fails_loudly() {
        let h = harness();
        let (id, session) = staked_match(&h, 13).await;
        h.ledger.insert_match(session, on_chain()).await;
        h.ledger.inject_failure("rpc unavailable").await;

        let err = h.service.cancel(&id, "player_left").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::CancellationUnconfirmed { .. }));
        // Nothing was marked cancelled.
        let record = h.matches.get(&id).await.unwrap().unwrap();
        assert_ne!(record.status, MatchStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unconfirmed_without_stake_is_best_effort() {
        let h = harness();
        let record = MatchRecord::new(MatchId::new_v4(), Address::new("GALICE"), Address::new("GBOB"));
        let id = record.match_id;
        h.matches.insert(record).await.unwrap();
        let session = SessionId::new(14).unwrap();
        h.matches.reserve_session(&id, session).await.unwrap();
        h.ledger.insert_match(session, on_chain()).await;
        h.ledger.inject_failure("rpc unavailable").await;

        let outcome = h.service.cancel(&id, "player_left").await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled { on_chain: OnChainCancel::Unconfirmed { .. } }));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let h = harness();
        let record = MatchRecord::new(MatchId::new_v4(), Address::new("GALICE"), Address::new("GBOB"));
        let id = record.match_id;
        h.matches.insert(record).await.unwrap();

        let first = h.service.cancel(&id, "timeout").await.unwrap();
        assert_eq!(first, CancelOutcome::Cancelled { on_chain: OnChainCancel::NotRegistered });
        assert_eq!(h.service.cancel(&id, "timeout").await.unwrap(), CancelOutcome::AlreadyCancelled);
    }
}
