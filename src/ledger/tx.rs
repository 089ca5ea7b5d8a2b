//! Transaction Model
//!
//! Ledger-agnostic shape of a contract invocation transaction:
//! the invocation itself, per-signer authorization entries, and the
//! envelope the service signs before submission.
//!
//! The payload string handed to clients is `hex(bincode(Transaction))`,
//! so a client can cache it and hand it back after a server restart.

use serde::{Deserialize, Serialize};

use crate::core::hash::{hash_bytes, DomainHasher, Hash32};
use crate::core::ids::{Address, SessionId, TxId};

/// A contract call the ledger can simulate and execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// Register a match; each player authorizes locking their own points.
    StartMatch {
        /// Session id reserved for this match.
        session_id: SessionId,
        /// First player.
        player1: Address,
        /// Second player.
        player2: Address,
        /// Points (stake) locked by player 1.
        player1_points: i128,
        /// Points (stake) locked by player 2.
        player2_points: i128,
    },

    /// Cancel a registered match. Authorized by the service alone.
    CancelMatch {
        /// Session to cancel.
        session_id: SessionId,
    },
}

impl Invocation {
    /// Contract function name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartMatch { .. } => "start_game",
            Self::CancelMatch { .. } => "cancel_game",
        }
    }

    /// Session the invocation targets.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::StartMatch { session_id, .. } | Self::CancelMatch { session_id } => *session_id,
        }
    }

    /// Hash binding an authorization to this exact call and its arguments.
    pub fn invocation_hash(&self) -> Hash32 {
        let mut hasher = DomainHasher::for_invocation();
        hasher.update_str(self.name());
        hasher.update_u32(self.session_id().get());
        if let Self::StartMatch { player1, player2, player1_points, player2_points, .. } = self {
            hasher.update_str(player1.as_str());
            hasher.update_str(player2.as_str());
            hasher.update_i128(*player1_points);
            hasher.update_i128(*player2_points);
        }
        hasher.finalize()
    }
}

/// One signer's authorization for an invocation.
///
/// Unsigned placeholders come back from simulation with no signature
/// and a zero expiration; the wallet fills both in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    /// Address whose permission this entry carries.
    pub address: Address,
    /// Replay-protection nonce chosen at simulation time.
    pub nonce: u64,
    /// Hash of the authorized invocation.
    pub invocation_hash: Hash32,
    /// Last ledger at which the signature is valid.
    pub expiration_ledger: u32,
    /// Signature over [`AuthEntry::signing_digest`], if signed.
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

impl AuthEntry {
    /// Create an unsigned placeholder.
    pub fn unsigned(address: Address, nonce: u64, invocation_hash: Hash32) -> Self {
        Self {
            address,
            nonce,
            invocation_hash,
            expiration_ledger: 0,
            signature: None,
        }
    }

    /// Whether a signature is attached.
    pub fn is_signed(&self) -> bool {
        self.signature.as_ref().map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Digest a signer commits to.
    pub fn signing_digest(&self) -> Hash32 {
        let mut hasher = DomainHasher::new(b"DUEL_AUTH_V1");
        hasher.update_str(self.address.as_str());
        hasher.update_u64(self.nonce);
        hasher.update_bytes(&self.invocation_hash);
        hasher.update_u32(self.expiration_ledger);
        hasher.finalize()
    }

    /// Whether this signed entry can stand in for `placeholder` in a
    /// transaction built at `latest_ledger`.
    ///
    /// The signature covers the invocation and the entry's own nonce, not
    /// the envelope, so it survives a rebuild as long as the invocation is
    /// unchanged and the signature has not expired.
    pub fn can_replace(&self, placeholder: &AuthEntry, latest_ledger: u32) -> bool {
        self.is_signed()
            && self.address == placeholder.address
            && self.invocation_hash == placeholder.invocation_hash
            && self.expiration_ledger > latest_ledger
    }
}

/// An unsigned (envelope-wise) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Source account; pays fees and signs the envelope.
    pub source: Address,
    /// Source account sequence number this transaction consumes.
    pub sequence: u64,
    /// The contract call.
    pub invocation: Invocation,
    /// Authorization slots, one per required signer.
    pub auth: Vec<AuthEntry>,
    /// Resource fee computed by the last simulation.
    pub resource_fee: u64,
}

impl Transaction {
    /// Transaction hash (also its ledger id once landed).
    pub fn hash(&self) -> Hash32 {
        hash_bytes(&bincode::serialize(self).unwrap_or_default())
    }

    /// Ledger id this transaction gets if it lands.
    pub fn tx_id(&self) -> TxId {
        TxId::from_hash(&self.hash())
    }

    /// Encode as an opaque payload string.
    pub fn to_payload(&self) -> Result<String, PayloadError> {
        let bytes = bincode::serialize(self).map_err(|e| PayloadError::Encode(e.to_string()))?;
        Ok(hex::encode(bytes))
    }

    /// Decode from an opaque payload string.
    pub fn from_payload(payload: &str) -> Result<Self, PayloadError> {
        let bytes = hex::decode(payload.trim()).map_err(|e| PayloadError::Decode(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| PayloadError::Decode(e.to_string()))
    }

    /// Addresses whose slot still holds an unsigned placeholder.
    pub fn unsigned_addresses(&self) -> Vec<Address> {
        self.auth
            .iter()
            .filter(|entry| !entry.is_signed())
            .map(|entry| entry.address.clone())
            .collect()
    }

    /// The slot for `address`, if the invocation needs its authorization.
    pub fn auth_slot(&self, address: &Address) -> Option<&AuthEntry> {
        self.auth.iter().find(|entry| &entry.address == address)
    }

    /// Put `signed` in place of the placeholder for its address.
    ///
    /// Returns `false` if there is no slot for that address.
    pub fn inject(&mut self, signed: AuthEntry) -> bool {
        match self.auth.iter_mut().find(|entry| entry.address == signed.address) {
            Some(slot) => {
                *slot = signed;
                true
            }
            None => false,
        }
    }
}

/// Transaction signed by the source account, ready to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// The transaction.
    pub transaction: Transaction,
    /// Source account signature over the transaction hash.
    pub signature: Vec<u8>,
}

/// Result of a dry-run.
#[derive(Debug, Clone)]
pub struct Simulation {
    /// Transaction with fresh sequence, fee and unsigned auth slots.
    pub transaction: Transaction,
    /// Authorizations the execution plan requires.
    ///
    /// `None` means the ledger answered without any authorization data.
    pub required_auth: Option<Vec<AuthEntry>>,
    /// Ledger height the simulation ran against.
    pub latest_ledger: u32,
}

/// On-chain match state, as the contract stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainMatch {
    /// First player.
    pub player1: Address,
    /// Second player.
    pub player2: Address,
    /// Player 1 locked points.
    pub player1_points: i128,
    /// Player 2 locked points.
    pub player2_points: i128,
}

/// Payload codec errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// Failed to encode.
    #[error("payload encode failed: {0}")]
    Encode(String),
    /// Failed to decode.
    #[error("payload decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(session: u32) -> Invocation {
        Invocation::StartMatch {
            session_id: SessionId::new(session).unwrap(),
            player1: Address::new("GPLAYERONE"),
            player2: Address::new("GPLAYERTWO"),
            player1_points: 100,
            player2_points: 100,
        }
    }

    fn sample_tx() -> Transaction {
        let invocation = start(42);
        let hash = invocation.invocation_hash();
        Transaction {
            source: Address::new("GSERVICE"),
            sequence: 7,
            invocation,
            auth: vec![
                AuthEntry::unsigned(Address::new("GPLAYERONE"), 1, hash),
                AuthEntry::unsigned(Address::new("GPLAYERTWO"), 2, hash),
            ],
            resource_fee: 120,
        }
    }

    #[test]
    fn test_invocation_hash_binds_arguments() {
        assert_eq!(start(1).invocation_hash(), start(1).invocation_hash());
        assert_ne!(start(1).invocation_hash(), start(2).invocation_hash());

        let cancel = Invocation::CancelMatch { session_id: SessionId::new(1).unwrap() };
        assert_ne!(cancel.invocation_hash(), start(1).invocation_hash());
    }

    #[test]
    fn test_payload_roundtrip() {
        let tx = sample_tx();
        let payload = tx.to_payload().unwrap();
        assert_eq!(Transaction::from_payload(&payload).unwrap(), tx);
        assert!(Transaction::from_payload("zz-not-hex").is_err());
    }

    #[test]
    fn test_inject_replaces_slot() {
        let mut tx = sample_tx();
        assert_eq!(tx.unsigned_addresses().len(), 2);

        let mut signed = tx.auth[0].clone();
        signed.expiration_ledger = 100;
        signed.signature = Some(vec![1, 2, 3]);

        assert!(tx.inject(signed));
        assert_eq!(tx.unsigned_addresses(), vec![Address::new("GPLAYERTWO")]);

        let mut stranger = tx.auth[1].clone();
        stranger.address = Address::new("GSTRANGER");
        assert!(!tx.inject(stranger));
    }

    #[test]
    fn test_can_replace_rules() {
        let tx = sample_tx();
        let placeholder = tx.auth[0].clone();

        let mut signed = placeholder.clone();
        signed.nonce = 99;
        signed.expiration_ledger = 50;
        signed.signature = Some(vec![9]);

        assert!(signed.can_replace(&placeholder, 10));
        // Expired
        assert!(!signed.can_replace(&placeholder, 50));
        // Different invocation
        let mut other = placeholder.clone();
        other.invocation_hash = start(43).invocation_hash();
        assert!(!signed.can_replace(&other, 10));
        // Unsigned never replaces
        assert!(!placeholder.can_replace(&placeholder, 0));
    }

    #[test]
    fn test_signing_digest_covers_expiration() {
        let mut entry = sample_tx().auth[0].clone();
        let before = entry.signing_digest();
        entry.expiration_ledger = 10;
        assert_ne!(before, entry.signing_digest());
    }
}
