//! Move Commitment Scheme
//!
//! A player commits to a whole move plan before the round starts and
//! reveals it afterwards. The commitment binds the plan to the exact
//! (match, round, turn, player) slot, so it cannot be replayed elsewhere.
//!
//! ```text
//! commitment = SHA256(
//!     "DUEL_MOVE_COMMIT_V1" ||
//!     match_id || round || turn || len(player) || player ||
//!     len(moves) || move codes || salt
//! )
//! ```

use serde::{Deserialize, Serialize};

use crate::core::hash::{DomainHasher, Hash32};
use crate::core::ids::{Address, MatchId};

/// Maximum moves in one plan.
pub const MAX_PLAN_MOVES: usize = 64;

/// A fighter move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    /// Fast, low damage.
    Punch,
    /// Slower, more damage.
    Kick,
    /// Absorbs a punch or kick.
    Block,
    /// Breaks a block.
    Special,
}

impl MoveType {
    /// All moves.
    pub const ALL: [MoveType; 4] = [Self::Punch, Self::Kick, Self::Block, Self::Special];

    /// Stable byte code used in commitments.
    pub fn code(self) -> u8 {
        match self {
            Self::Punch => 1,
            Self::Kick => 2,
            Self::Block => 3,
            Self::Special => 4,
        }
    }

    /// Inverse of [`MoveType::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }
}

/// A player's hidden plan for a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePlan {
    /// Moves, cycled per turn.
    pub moves: Vec<MoveType>,
    /// Blinding salt.
    pub salt: [u8; 32],
}

impl MovePlan {
    /// Create a plan.
    pub fn new(moves: Vec<MoveType>, salt: [u8; 32]) -> Self {
        Self { moves, salt }
    }

    /// Whether the plan is usable (non-empty, bounded).
    pub fn is_valid(&self) -> bool {
        !self.moves.is_empty() && self.moves.len() <= MAX_PLAN_MOVES
    }

    /// Move played on `turn` (1-based).
    pub fn move_for_turn(&self, turn: u32) -> Option<MoveType> {
        if self.moves.is_empty() || turn == 0 {
            return None;
        }
        let index = (turn as usize - 1) % self.moves.len();
        self.moves.get(index).copied()
    }
}

/// Compute the commitment for `plan` in the given slot.
pub fn compute_move_commitment(
    match_id: &MatchId,
    round: u32,
    turn: u32,
    player: &Address,
    plan: &MovePlan,
) -> Hash32 {
    let mut hasher = DomainHasher::for_move_commitment();
    hasher.update_uuid(match_id.as_bytes());
    hasher.update_u32(round);
    hasher.update_u32(turn);
    hasher.update_str(player.as_str());
    hasher.update_u32(plan.moves.len() as u32);
    for m in &plan.moves {
        hasher.update_u8(m.code());
    }
    hasher.update_bytes(&plan.salt);
    hasher.finalize()
}

/// Whether `plan` reproduces `commitment` in the given slot.
pub fn verify_move_commitment(
    commitment: &Hash32,
    match_id: &MatchId,
    round: u32,
    turn: u32,
    player: &Address,
    plan: &MovePlan,
) -> bool {
    &compute_move_commitment(match_id, round, turn, player, plan) == commitment
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn plan() -> MovePlan {
        MovePlan::new(vec![MoveType::Punch, MoveType::Block, MoveType::Special], [9; 32])
    }

    #[test]
    fn test_move_for_turn_cycles() {
        let plan = plan();
        assert_eq!(plan.move_for_turn(1), Some(MoveType::Punch));
        assert_eq!(plan.move_for_turn(3), Some(MoveType::Special));
        assert_eq!(plan.move_for_turn(4), Some(MoveType::Punch));
        assert_eq!(plan.move_for_turn(0), None);
        assert_eq!(MovePlan::new(vec![], [0; 32]).move_for_turn(1), None);
    }

    #[test]
    fn test_commitment_binds_slot() {
        let id = MatchId::from_bytes([1; 16]);
        let alice = Address::new("GALICE");
        let c = compute_move_commitment(&id, 1, 1, &alice, &plan());

        assert!(verify_move_commitment(&c, &id, 1, 1, &alice, &plan()));
        assert!(!verify_move_commitment(&c, &id, 1, 2, &alice, &plan()));
        assert!(!verify_move_commitment(&c, &id, 2, 1, &alice, &plan()));
        assert!(!verify_move_commitment(&c, &id, 1, 1, &Address::new("GBOB"), &plan()));
    }

    #[test]
    fn test_codes_roundtrip() {
        for m in MoveType::ALL {
            assert_eq!(MoveType::from_code(m.code()), Some(m));
        }
        assert_eq!(MoveType::from_code(0), None);
    }

    fn arb_move() -> impl Strategy<Value = MoveType> {
        prop::sample::select(MoveType::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_commitment_binds_plan(
            moves in prop::collection::vec(arb_move(), 1..8),
            other in prop::collection::vec(arb_move(), 1..8),
            salt in any::<[u8; 32]>(),
            other_salt in any::<[u8; 32]>(),
        ) {
            let id = MatchId::from_bytes([3; 16]);
            let player = Address::new("GALICE");
            let committed = MovePlan::new(moves, salt);
            let revealed = MovePlan::new(other, other_salt);
            let c = compute_move_commitment(&id, 1, 1, &player, &committed);

            prop_assert_eq!(
                verify_move_commitment(&c, &id, 1, 1, &player, &revealed),
                committed == revealed
            );
        }
    }
}
