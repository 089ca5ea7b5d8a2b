//! Match Record Store
//!
//! Persistent per-match record: participants, lifecycle status, the
//! reserved session id, registration transaction, stake confirmations
//! and the last prepared payload (for restart recovery).
//!
//! The store owns the uniqueness constraint on session ids; session
//! allocation relies on it to close the check-then-persist race.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::ids::{Address, MatchId, SessionId, TxId};
use crate::store::StoreError;

/// Off-chain match lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Players paired, nothing on-chain yet.
    Created,
    /// Registration in progress.
    Registering,
    /// Registered on-chain; rounds being played.
    InProgress,
    /// Finished.
    Completed,
    /// Aborted before or during registration.
    Cancelled,
}

impl MatchStatus {
    /// Whether no further transitions are expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Wager attached to a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    /// Points each player locks.
    pub amount: i128,
    /// Players whose deposit has been confirmed.
    pub confirmed_by: BTreeSet<Address>,
}

impl Stake {
    /// New unconfirmed stake.
    pub fn new(amount: i128) -> Self {
        Self { amount, confirmed_by: BTreeSet::new() }
    }
}

/// Persisted match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Match id.
    pub match_id: MatchId,
    /// First player.
    pub player1: Address,
    /// Second player.
    pub player2: Address,
    /// Lifecycle status.
    pub status: MatchStatus,
    /// Reserved on-chain session id.
    pub session_id: Option<SessionId>,
    /// Registration transaction id, when known.
    pub registration_tx: Option<TxId>,
    /// Wager, if any.
    pub stake: Option<Stake>,
    /// Last prepared registration payload.
    pub registration_payload: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    /// New match between two players.
    pub fn new(match_id: MatchId, player1: Address, player2: Address) -> Self {
        Self {
            match_id,
            player1,
            player2,
            status: MatchStatus::Created,
            session_id: None,
            registration_tx: None,
            stake: None,
            registration_payload: None,
            created_at: Utc::now(),
        }
    }

    /// Attach a stake.
    pub fn with_stake(mut self, amount: i128) -> Self {
        self.stake = Some(Stake::new(amount));
        self
    }

    /// Whether `address` is one of the two players.
    pub fn is_participant(&self, address: &Address) -> bool {
        &self.player1 == address || &self.player2 == address
    }

    /// Points each player locks on-chain.
    pub fn stake_amount(&self) -> i128 {
        self.stake.as_ref().map(|s| s.amount).unwrap_or(0)
    }

    /// Whether any player's stake deposit has been confirmed.
    pub fn has_confirmed_stake(&self) -> bool {
        self.stake.as_ref().map(|s| !s.confirmed_by.is_empty()).unwrap_or(false)
    }
}

/// Persistent match store.
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, record: MatchRecord) -> Result<(), StoreError>;

    /// Fetch a record.
    async fn get(&self, match_id: &MatchId) -> Result<Option<MatchRecord>, StoreError>;

    /// Match currently holding `session_id`, if any.
    async fn session_owner(&self, session_id: SessionId) -> Result<Option<MatchId>, StoreError>;

    /// Reserve `session_id` for `match_id`.
    ///
    /// Fails with [`StoreError::SessionTaken`] if another match holds it.
    async fn reserve_session(&self, match_id: &MatchId, session_id: SessionId) -> Result<(), StoreError>;

    /// Record a completed registration and move the match in progress.
    async fn record_registration(
        &self,
        match_id: &MatchId,
        session_id: SessionId,
        tx_id: Option<TxId>,
    ) -> Result<(), StoreError>;

    /// Set the lifecycle status.
    async fn set_status(&self, match_id: &MatchId, status: MatchStatus) -> Result<(), StoreError>;

    /// Remember (or forget) the prepared registration payload.
    async fn remember_payload(&self, match_id: &MatchId, payload: Option<String>) -> Result<(), StoreError>;

    /// Mark `address`'s stake deposit as confirmed.
    async fn confirm_stake(&self, match_id: &MatchId, address: &Address) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MatchTables {
    records: BTreeMap<MatchId, MatchRecord>,
    sessions: BTreeMap<SessionId, MatchId>,
}

impl MatchTables {
    fn record_mut(&mut self, match_id: &MatchId) -> Result<&mut MatchRecord, StoreError> {
        self.records.get_mut(match_id).ok_or(StoreError::MatchNotFound(*match_id))
    }
}

/// Process-local match store.
#[derive(Debug, Default)]
pub struct InMemoryMatchStore {
    tables: RwLock<MatchTables>,
}

impl InMemoryMatchStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reserved session ids.
    pub async fn reserved_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }
}

#[async_trait]
impl MatchStore for InMemoryMatchStore {
    async fn insert(&self, record: MatchRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(session_id) = record.session_id {
            if let Some(owner) = tables.sessions.get(&session_id) {
                if owner != &record.match_id {
                    return Err(StoreError::SessionTaken { session_id, owner: *owner });
                }
            }
            tables.sessions.insert(session_id, record.match_id);
        }
        tables.records.insert(record.match_id, record);
        Ok(())
    }

    async fn get(&self, match_id: &MatchId) -> Result<Option<MatchRecord>, StoreError> {
        Ok(self.tables.read().await.records.get(match_id).cloned())
    }

    async fn session_owner(&self, session_id: SessionId) -> Result<Option<MatchId>, StoreError> {
        Ok(self.tables.read().await.sessions.get(&session_id).copied())
    }

    async fn reserve_session(&self, match_id: &MatchId, session_id: SessionId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(owner) = tables.sessions.get(&session_id) {
            if owner != match_id {
                return Err(StoreError::SessionTaken { session_id, owner: *owner });
            }
            return Ok(());
        }

        let previous = tables.record_mut(match_id)?.session_id.replace(session_id);
        if let Some(previous) = previous {
            tables.sessions.remove(&previous);
        }
        tables.sessions.insert(session_id, *match_id);
        Ok(())
    }

    async fn record_registration(
        &self,
        match_id: &MatchId,
        session_id: SessionId,
        tx_id: Option<TxId>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables.record_mut(match_id)?;
        record.session_id = Some(session_id);
        if tx_id.is_some() {
            record.registration_tx = tx_id;
        }
        record.registration_payload = None;
        record.status = MatchStatus::InProgress;
        Ok(())
    }

    async fn set_status(&self, match_id: &MatchId, status: MatchStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.record_mut(match_id)?.status = status;
        Ok(())
    }

    async fn remember_payload(&self, match_id: &MatchId, payload: Option<String>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.record_mut(match_id)?.registration_payload = payload;
        Ok(())
    }

    async fn confirm_stake(&self, match_id: &MatchId, address: &Address) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables.record_mut(match_id)?;
        if !record.is_participant(address) {
            return Err(StoreError::Backend(format!("{} is not a player in {}", address, match_id)));
        }
        record
            .stake
            .get_or_insert_with(|| Stake::new(0))
            .confirmed_by
            .insert(address.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MatchRecord {
        MatchRecord::new(MatchId::new_v4(), Address::new("GALICE"), Address::new("GBOB"))
    }

    #[tokio::test]
    async fn test_session_uniqueness() {
        let store = InMemoryMatchStore::new();
        let a = record();
        let b = record();
        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        let sid = SessionId::new(77).unwrap();
        store.reserve_session(&a.match_id, sid).await.unwrap();
        // Idempotent for the owner
        store.reserve_session(&a.match_id, sid).await.unwrap();

        let err = store.reserve_session(&b.match_id, sid).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionTaken { owner, .. } if owner == a.match_id));
        assert_eq!(store.session_owner(sid).await.unwrap(), Some(a.match_id));
    }

    #[tokio::test]
    async fn test_rereserve_releases_previous() {
        let store = InMemoryMatchStore::new();
        let a = record();
        store.insert(a.clone()).await.unwrap();

        let first = SessionId::new(1).unwrap();
        let second = SessionId::new(2).unwrap();
        store.reserve_session(&a.match_id, first).await.unwrap();
        store.reserve_session(&a.match_id, second).await.unwrap();

        assert_eq!(store.session_owner(first).await.unwrap(), None);
        assert_eq!(store.reserved_count().await, 1);
    }

    #[tokio::test]
    async fn test_record_registration() {
        let store = InMemoryMatchStore::new();
        let a = record();
        store.insert(a.clone()).await.unwrap();
        store.remember_payload(&a.match_id, Some("beef".into())).await.unwrap();

        let sid = SessionId::new(5).unwrap();
        let tx = TxId::from_hash(&[1; 32]);
        store.record_registration(&a.match_id, sid, Some(tx.clone())).await.unwrap();

        let saved = store.get(&a.match_id).await.unwrap().unwrap();
        assert_eq!(saved.status, MatchStatus::InProgress);
        assert_eq!(saved.registration_tx, Some(tx));
        assert_eq!(saved.registration_payload, None);
    }

    #[tokio::test]
    async fn test_confirm_stake() {
        let store = InMemoryMatchStore::new();
        let a = record().with_stake(500);
        store.insert(a.clone()).await.unwrap();
        assert!(!store.get(&a.match_id).await.unwrap().unwrap().has_confirmed_stake());

        store.confirm_stake(&a.match_id, &Address::new("GALICE")).await.unwrap();
        assert!(store.get(&a.match_id).await.unwrap().unwrap().has_confirmed_stake());

        assert!(store.confirm_stake(&a.match_id, &Address::new("GMALLORY")).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_match() {
        let store = InMemoryMatchStore::new();
        let err = store.set_status(&MatchId::new_v4(), MatchStatus::Cancelled).await;
        assert!(matches!(err, Err(StoreError::MatchNotFound(_))));
    }
}
