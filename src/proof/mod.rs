//! Hidden-Move Rounds
//!
//! Players commit to a move plan (with a proof) before a round and reveal
//! it afterwards. The server stores commitments, checks proofs through an
//! opaque verifier and only accepts reveals that reproduce them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ROUND PROOFS                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  commitment.rs   - Move plans and slot-bound commitments    │
//! │  verify.rs       - Proof verifier interface + stub          │
//! │  rounds.rs       - Write-once commit store, reveal checks   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod commitment;
pub mod rounds;
pub mod verify;

pub use commitment::{compute_move_commitment, verify_move_commitment, MovePlan, MoveType, MAX_PLAN_MOVES};
pub use rounds::{
    CommitOutcome, CommitRecord, CommitRequest, ResolveOutcome, Reveal, RoundCommitmentLedger, RoundResolution,
    RoundState,
};
pub use verify::{ProofVerificationError, ProofVerifier, PublicInputs, StubProofVerifier};
