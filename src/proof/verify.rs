//! Proof Verification Interface
//!
//! Proof generation happens on the client. This crate only asks a
//! verifier whether a proof is valid for a commitment and its public
//! inputs; the proof system itself is opaque.

use serde::{Deserialize, Serialize};

use crate::core::hash::Hash32;

/// Public inputs attached to a proof.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputs {
    /// Field elements / digests, in circuit order.
    pub values: Vec<Hash32>,
}

impl PublicInputs {
    /// Public inputs exposing a single commitment.
    pub fn for_commitment(commitment: Hash32) -> Self {
        Self { values: vec![commitment] }
    }

    /// Whether `value` is among the inputs.
    pub fn contains(&self, value: &Hash32) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Errors during proof verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofVerificationError {
    /// Proof bytes are malformed.
    #[error("invalid proof format")]
    InvalidProofFormat,

    /// Public inputs do not expose the commitment.
    #[error("public inputs do not match commitment")]
    PublicInputMismatch,

    /// Verifier backend unreachable.
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// Proof verification collaborator.
pub trait ProofVerifier: Send + Sync {
    /// Verify `proof` for `commitment` and `public_inputs`.
    fn verify(
        &self,
        commitment: &Hash32,
        proof: &[u8],
        public_inputs: &PublicInputs,
    ) -> Result<bool, ProofVerificationError>;
}

/// Stub verifier for tests and local runs.
///
/// Accepts any non-empty proof whose public inputs contain the commitment.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubProofVerifier;

impl ProofVerifier for StubProofVerifier {
    fn verify(
        &self,
        commitment: &Hash32,
        proof: &[u8],
        public_inputs: &PublicInputs,
    ) -> Result<bool, ProofVerificationError> {
        if proof.is_empty() {
            return Err(ProofVerificationError::InvalidProofFormat);
        }
        if !public_inputs.contains(commitment) {
            return Err(ProofVerificationError::PublicInputMismatch);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_verifier() {
        let verifier = StubProofVerifier;
        let commitment = [5u8; 32];
        let inputs = PublicInputs::for_commitment(commitment);

        assert_eq!(verifier.verify(&commitment, &[], &inputs), Err(ProofVerificationError::InvalidProofFormat));
        assert_eq!(verifier.verify(&commitment, &[1, 2, 3], &inputs), Ok(true));
        assert_eq!(
            verifier.verify(&[6u8; 32], &[1, 2, 3], &inputs),
            Err(ProofVerificationError::PublicInputMismatch)
        );
    }
}
