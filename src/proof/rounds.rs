//! Round Commitment Ledger
//!
//! Stores one commitment (plus proof) per (match, round, turn, player) and
//! gates round resolution on verified proofs and matching reveals.
//!
//! Per (match, round, turn):
//!
//! ```text
//! none ─► player1_committed ─┐
//!      └► player2_committed ─┴─► both_committed ─(both reveals)─► resolved
//! ```
//!
//! Commitments are write-once. Resolution never trusts a reveal that does
//! not reproduce the stored commitment.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::hash::{short_hex, Hash32};
use crate::core::ids::{Address, MatchId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::network::notify::{MatchNotification, Notifier};
use crate::proof::commitment::{verify_move_commitment, MovePlan, MoveType};
use crate::proof::verify::{ProofVerifier, PublicInputs};

/// A player's commit for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Round number.
    pub round: u32,
    /// Turn number (1-based).
    pub turn: u32,
    /// Move commitment.
    pub commitment: Hash32,
    /// Proof bytes.
    pub proof: Vec<u8>,
    /// Proof public inputs.
    pub public_inputs: PublicInputs,
    /// Hash of the client's round transcript.
    pub transcript_hash: Hash32,
}

/// Stored commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Match.
    pub match_id: MatchId,
    /// Round number.
    pub round: u32,
    /// Turn number.
    pub turn: u32,
    /// Committing player.
    pub player: Address,
    /// Move commitment.
    pub commitment: Hash32,
    /// Proof bytes.
    pub proof: Vec<u8>,
    /// Proof public inputs.
    pub public_inputs: PublicInputs,
    /// Transcript hash.
    pub transcript_hash: Hash32,
    /// Proof has been verified.
    pub verified: bool,
    /// When the commit arrived.
    pub committed_at: DateTime<Utc>,
}

impl CommitRecord {
    fn same_payload(&self, request: &CommitRequest) -> bool {
        self.commitment == request.commitment
            && self.proof == request.proof
            && self.public_inputs == request.public_inputs
            && self.transcript_hash == request.transcript_hash
    }
}

/// A player's reveal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reveal {
    /// Move played this turn.
    pub move_type: MoveType,
    /// Committed plan.
    pub plan: MovePlan,
    /// Winner this player computed (`None` = draw).
    pub expected_winner: Option<Address>,
}

/// Per-turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// No commitments.
    None,
    /// Only player 1 committed.
    Player1Committed,
    /// Only player 2 committed.
    Player2Committed,
    /// Both committed.
    BothCommitted,
    /// Outcome accepted.
    Resolved,
}

/// Result of `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Stored.
    Recorded(RoundState),
    /// Identical to the stored commit.
    Replayed(RoundState),
}

/// Accepted round outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResolution {
    /// Revealed move per player.
    pub moves: BTreeMap<Address, MoveType>,
    /// Agreed winner.
    pub winner: Option<Address>,
}

/// Result of `resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Reveal accepted; opponent has not revealed.
    AwaitingReveal {
        /// Players that revealed.
        revealed: Vec<Address>,
    },
    /// Both reveals accepted.
    Resolved(RoundResolution),
}

#[derive(Debug, Default)]
struct TurnEntry {
    commits: BTreeMap<Address, CommitRecord>,
    reveals: BTreeMap<Address, Reveal>,
    resolution: Option<RoundResolution>,
}

#[derive(Debug)]
struct MatchRounds {
    player1: Address,
    player2: Address,
    turns: BTreeMap<(u32, u32), TurnEntry>,
}

impl MatchRounds {
    fn is_participant(&self, address: &Address) -> bool {
        &self.player1 == address || &self.player2 == address
    }

    fn state(&self, key: (u32, u32)) -> RoundState {
        let Some(entry) = self.turns.get(&key) else {
            return RoundState::None;
        };
        if entry.resolution.is_some() {
            return RoundState::Resolved;
        }
        match (entry.commits.contains_key(&self.player1), entry.commits.contains_key(&self.player2)) {
            (true, true) => RoundState::BothCommitted,
            (true, false) => RoundState::Player1Committed,
            (false, true) => RoundState::Player2Committed,
            (false, false) => RoundState::None,
        }
    }
}

/// Commit/reveal store for match rounds.
pub struct RoundCommitmentLedger {
    verifier: Arc<dyn ProofVerifier>,
    notifier: Arc<dyn Notifier>,
    verify_on_commit: bool,
    matches: RwLock<BTreeMap<MatchId, MatchRounds>>,
}

impl RoundCommitmentLedger {
    /// Create a ledger. With `verify_on_commit` off, proofs are verified at
    /// resolution instead.
    pub fn new(verifier: Arc<dyn ProofVerifier>, notifier: Arc<dyn Notifier>, verify_on_commit: bool) -> Self {
        Self {
            verifier,
            notifier,
            verify_on_commit,
            matches: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start tracking a match's rounds.
    pub async fn register_match(&self, match_id: MatchId, player1: Address, player2: Address) {
        let mut matches = self.matches.write().await;
        matches.entry(match_id).or_insert_with(|| MatchRounds {
            player1,
            player2,
            turns: BTreeMap::new(),
        });
    }

    /// Stop tracking a match.
    pub async fn forget_match(&self, match_id: &MatchId) {
        self.matches.write().await.remove(match_id);
    }

    /// Whether the match is tracked.
    pub async fn is_registered(&self, match_id: &MatchId) -> bool {
        self.matches.read().await.contains_key(match_id)
    }

    /// State of one turn.
    pub async fn state(&self, match_id: &MatchId, round: u32, turn: u32) -> CoordinatorResult<RoundState> {
        let matches = self.matches.read().await;
        let rounds = matches.get(match_id).ok_or_else(|| not_found(match_id))?;
        Ok(rounds.state((round, turn)))
    }

    /// Stored commit for a player, if any.
    pub async fn commit_record(
        &self,
        match_id: &MatchId,
        round: u32,
        turn: u32,
        player: &Address,
    ) -> Option<CommitRecord> {
        let matches = self.matches.read().await;
        matches
            .get(match_id)?
            .turns
            .get(&(round, turn))?
            .commits
            .get(player)
            .cloned()
    }

    /// Store `player`'s commitment for a turn.
    ///
    /// Identical replays are accepted; a different payload for an occupied
    /// slot is [`CoordinatorError::AlreadyCommitted`].
    pub async fn commit(
        &self,
        match_id: &MatchId,
        player: &Address,
        request: CommitRequest,
    ) -> CoordinatorResult<CommitOutcome> {
        let key = (request.round, request.turn);
        if let Some(outcome) = self.check_slot(match_id, player, &request).await? {
            return Ok(outcome);
        }

        let verified = if self.verify_on_commit {
            if !self.verify(&request.commitment, &request.proof, &request.public_inputs) {
                warn!(match_id = %match_id, player = %player.short(), round = request.round, turn = request.turn, "proof rejected on commit");
                return Err(CoordinatorError::ProofRejected {
                    match_id: *match_id,
                    round: request.round,
                    turn: request.turn,
                    player: player.clone(),
                });
            }
            true
        } else {
            false
        };

        let state = {
            let mut matches = self.matches.write().await;
            let rounds = matches.get_mut(match_id).ok_or_else(|| not_found(match_id))?;

            // Re-check: another commit may have landed while verifying.
            let existing = rounds
                .turns
                .get(&key)
                .and_then(|entry| entry.commits.get(player))
                .map(|record| record.same_payload(&request));
            match existing {
                Some(true) => return Ok(CommitOutcome::Replayed(rounds.state(key))),
                Some(false) => return Err(already_committed(match_id, key, player)),
                None => {}
            }

            rounds.turns.entry(key).or_default().commits.insert(player.clone(), CommitRecord {
                match_id: *match_id,
                round: request.round,
                turn: request.turn,
                player: player.clone(),
                commitment: request.commitment,
                proof: request.proof,
                public_inputs: request.public_inputs,
                transcript_hash: request.transcript_hash,
                verified,
                committed_at: Utc::now(),
            });
            rounds.state(key)
        };

        info!(
            match_id = %match_id,
            player = %player.short(),
            round = request.round,
            turn = request.turn,
            commitment = %short_hex(&request.commitment),
            state = ?state,
            "move committed"
        );
        self.notifier.publish(*match_id, MatchNotification::RoundCommitted {
            round: request.round,
            turn: request.turn,
            player: player.clone(),
            both_committed: state == RoundState::BothCommitted,
        });

        Ok(CommitOutcome::Recorded(state))
    }

    /// Accept `player`'s reveal for a turn.
    ///
    /// Requires both commitments with verified proofs. The reveal must
    /// reproduce the player's commitment and its move must be the plan's
    /// move for this turn.
    pub async fn resolve(
        &self,
        match_id: &MatchId,
        round: u32,
        turn: u32,
        player: &Address,
        reveal: Reveal,
    ) -> CoordinatorResult<ResolveOutcome> {
        let key = (round, turn);
        let mut matches = self.matches.write().await;
        let rounds = matches.get_mut(match_id).ok_or_else(|| not_found(match_id))?;
        if !rounds.is_participant(player) {
            return Err(CoordinatorError::Forbidden { match_id: *match_id, address: player.clone() });
        }
        if rounds.state(key) != RoundState::BothCommitted && rounds.state(key) != RoundState::Resolved {
            return Err(CoordinatorError::RoundNotReady(format!(
                "match {} round {} turn {} is not fully committed",
                match_id, round, turn
            )));
        }

        let players = [rounds.player1.clone(), rounds.player2.clone()];
        let entry = rounds.turns.entry(key).or_default();
        if let Some(resolution) = &entry.resolution {
            return Ok(ResolveOutcome::Resolved(resolution.clone()));
        }

        // Deferred proof verification.
        for address in &players {
            let Some(record) = entry.commits.get(address) else {
                continue;
            };
            if record.verified {
                continue;
            }
            if !self.verify(&record.commitment, &record.proof, &record.public_inputs) {
                warn!(match_id = %match_id, player = %address.short(), round, turn, "proof rejected at resolution");
                return Err(CoordinatorError::ProofRejected {
                    match_id: *match_id,
                    round,
                    turn,
                    player: address.clone(),
                });
            }
            if let Some(record) = entry.commits.get_mut(address) {
                record.verified = true;
            }
        }

        let mismatch = || CoordinatorError::RevealMismatch {
            match_id: *match_id,
            round,
            turn,
            player: player.clone(),
        };
        let record = entry.commits.get(player).ok_or_else(mismatch)?;
        if !verify_move_commitment(&record.commitment, match_id, round, turn, player, &reveal.plan) {
            warn!(match_id = %match_id, player = %player.short(), round, turn, "reveal does not match commitment");
            return Err(mismatch());
        }
        if reveal.plan.move_for_turn(turn) != Some(reveal.move_type) {
            warn!(match_id = %match_id, player = %player.short(), round, turn, "revealed move is not the planned move");
            return Err(mismatch());
        }
        if let Some(winner) = &reveal.expected_winner {
            if !players.contains(winner) {
                return Err(disputed(match_id, key));
            }
        }

        if let Some(previous) = entry.reveals.get(player) {
            if previous.expected_winner != reveal.expected_winner {
                return Err(disputed(match_id, key));
            }
        }
        entry.reveals.insert(player.clone(), reveal);

        if entry.reveals.len() < players.len() {
            debug!(match_id = %match_id, round, turn, "waiting for opponent reveal");
            return Ok(ResolveOutcome::AwaitingReveal { revealed: entry.reveals.keys().cloned().collect() });
        }

        let mut winners = entry.reveals.values().map(|r| r.expected_winner.clone());
        let winner = winners.next().flatten();
        if winners.any(|w| w != winner) {
            warn!(match_id = %match_id, round, turn, "reveals disagree on winner");
            return Err(disputed(match_id, key));
        }

        let resolution = RoundResolution {
            moves: entry.reveals.iter().map(|(a, r)| (a.clone(), r.move_type)).collect(),
            winner,
        };
        entry.resolution = Some(resolution.clone());
        drop(matches);

        info!(match_id = %match_id, round, turn, winner = ?resolution.winner, "round resolved");
        self.notifier.publish(*match_id, MatchNotification::RoundResolved {
            round,
            turn,
            moves: resolution.moves.clone(),
            winner: resolution.winner.clone(),
        });
        Ok(ResolveOutcome::Resolved(resolution))
    }

    /// Replay/conflict check before verification. `None` = slot free.
    async fn check_slot(
        &self,
        match_id: &MatchId,
        player: &Address,
        request: &CommitRequest,
    ) -> CoordinatorResult<Option<CommitOutcome>> {
        let key = (request.round, request.turn);
        let matches = self.matches.read().await;
        let rounds = matches.get(match_id).ok_or_else(|| not_found(match_id))?;
        if !rounds.is_participant(player) {
            return Err(CoordinatorError::Forbidden { match_id: *match_id, address: player.clone() });
        }
        match rounds.turns.get(&key).and_then(|entry| entry.commits.get(player)) {
            None => Ok(None),
            Some(existing) if existing.same_payload(request) => {
                debug!(match_id = %match_id, player = %player.short(), "commit replayed");
                Ok(Some(CommitOutcome::Replayed(rounds.state(key))))
            }
            Some(_) => Err(already_committed(match_id, key, player)),
        }
    }

    fn verify(&self, commitment: &Hash32, proof: &[u8], public_inputs: &PublicInputs) -> bool {
        match self.verifier.verify(commitment, proof, public_inputs) {
            Ok(valid) => valid,
            Err(e) => {
                debug!(error = %e, "proof verification error");
                false
            }
        }
    }
}

fn not_found(match_id: &MatchId) -> CoordinatorError {
    CoordinatorError::NotFound(format!("rounds for match {}", match_id))
}

fn already_committed(match_id: &MatchId, key: (u32, u32), player: &Address) -> CoordinatorError {
    CoordinatorError::AlreadyCommitted {
        match_id: *match_id,
        round: key.0,
        turn: key.1,
        player: player.clone(),
    }
}

fn disputed(match_id: &MatchId, key: (u32, u32)) -> CoordinatorError {
    CoordinatorError::OutcomeDisputed { match_id: *match_id, round: key.0, turn: key.1 }
}
