//! Pending Registration Store
//!
//! Holds the in-flight [`PendingRegistration`] for each match. Updates are
//! optimistic: every record carries a version and a write only succeeds if
//! the version it read is still current. That is enough to make "record the
//! last signature and set the submitted guard" atomic across concurrent
//! requests, whether the backing store is a local map or a shared service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::ids::MatchId;
use crate::registration::PendingRegistration;
use crate::store::StoreError;

/// A value together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// Store version of the value.
    pub version: u64,
    /// The value.
    pub value: T,
}

/// Versioned key-value store for pending registrations.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Read the record for `match_id`.
    async fn load(&self, match_id: &MatchId) -> Result<Option<Versioned<PendingRegistration>>, StoreError>;

    /// Write `value` if the stored version still equals `expected`
    /// (`None` = the record must not exist). Returns the new version.
    async fn store(
        &self,
        match_id: &MatchId,
        expected: Option<u64>,
        value: PendingRegistration,
    ) -> Result<u64, StoreError>;

    /// Delete the record if its version still equals `expected`.
    async fn remove(&self, match_id: &MatchId, expected: u64) -> Result<(), StoreError>;

    /// Every record, for timeout sweeps.
    async fn list(&self) -> Result<Vec<Versioned<PendingRegistration>>, StoreError>;
}

#[derive(Debug, Default)]
struct PendingTable {
    next_version: u64,
    records: BTreeMap<MatchId, Versioned<PendingRegistration>>,
}

/// Process-local pending store.
#[derive(Debug, Default)]
pub struct InMemoryPendingStore {
    table: RwLock<PendingTable>,
}

impl InMemoryPendingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending registrations.
    pub async fn len(&self) -> usize {
        self.table.read().await.records.len()
    }

    /// Whether there are no pending registrations.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PendingStore for InMemoryPendingStore {
    async fn load(&self, match_id: &MatchId) -> Result<Option<Versioned<PendingRegistration>>, StoreError> {
        Ok(self.table.read().await.records.get(match_id).cloned())
    }

    async fn store(
        &self,
        match_id: &MatchId,
        expected: Option<u64>,
        value: PendingRegistration,
    ) -> Result<u64, StoreError> {
        let mut table = self.table.write().await;
        let current = table.records.get(match_id).map(|v| v.version);
        if current != expected {
            return Err(StoreError::VersionConflict);
        }
        table.next_version += 1;
        let version = table.next_version;
        table.records.insert(*match_id, Versioned { version, value });
        Ok(version)
    }

    async fn remove(&self, match_id: &MatchId, expected: u64) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        match table.records.get(match_id) {
            Some(current) if current.version == expected => {
                table.records.remove(match_id);
                Ok(())
            }
            _ => Err(StoreError::VersionConflict),
        }
    }

    async fn list(&self) -> Result<Vec<Versioned<PendingRegistration>>, StoreError> {
        Ok(self.table.read().await.records.values().cloned().collect())
    }
}
