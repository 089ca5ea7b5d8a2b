//! Core primitives.
//!
//! Identifiers and deterministic hashing shared by the registration
//! flow and the round commitment ledger.

pub mod hash;
pub mod ids;

// Re-export core types
pub use hash::{DomainHasher, Hash32, hash_bytes, hash_with_domain};
pub use ids::{Address, MatchId, SessionId, TxId};
