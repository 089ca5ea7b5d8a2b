//! Domain-Separated Hashing
//!
//! Provides deterministic SHA-256 hashing for:
//! - Session identifier derivation
//! - Move commitments
//! - Authorization digests and invocation binding

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type Hash32 = [u8; 32];

/// Deterministic hasher with a domain separator.
///
/// Wraps SHA-256 with helpers for the fixed-width values we bind.
/// Order of updates is critical for determinism.
pub struct DomainHasher {
    hasher: Sha256,
}

impl DomainHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for session id candidates.
    pub fn for_session_candidate() -> Self {
        Self::new(b"DUEL_SESSION_V1")
    }

    /// Create hasher for move commitments.
    pub fn for_move_commitment() -> Self {
        Self::new(b"DUEL_MOVE_COMMIT_V1")
    }

    /// Create hasher for contract invocations.
    pub fn for_invocation() -> Self {
        Self::new(b"DUEL_INVOCATION_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a length-prefixed string.
    ///
    /// The prefix keeps `("ab", "c")` and `("a", "bc")` distinct.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i128 value (little-endian).
    #[inline]
    pub fn update_i128(&mut self, value: i128) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a UUID (16 bytes).
    #[inline]
    pub fn update_uuid(&mut self, uuid: &[u8; 16]) {
        self.hasher.update(uuid);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Hash32 {
        self.hasher.finalize().into()
    }
}

/// Compute a simple hash of arbitrary data.
pub fn hash_bytes(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Truncate a hash to its first four bytes, big-endian.
pub fn truncate_u32(hash: &Hash32) -> u32 {
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Format a hash for log output (first 8 hex chars).
pub fn short_hex(hash: &Hash32) -> String {
    hex::encode(&hash[..4])
}
