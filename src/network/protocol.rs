//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::core::hash::Hash32;
use crate::core::ids::{Address, MatchId, SessionId, TxId};
use crate::error::CoordinatorError;
use crate::ledger::AuthEntry;
use crate::network::notify::MatchNotification;
use crate::proof::commitment::{MovePlan, MoveType};
use crate::proof::rounds::{CommitOutcome, ResolveOutcome, RoundResolution, RoundState};
use crate::proof::verify::PublicInputs;
use crate::registration::cancel::CancelOutcome;
use crate::registration::coordinator::{PrepareOutcome, RegistrationProgress, RegistrationView};
use crate::registration::status::RegistrationStatus;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Fetch (or build) the registration transaction for a match.
    PrepareRegistration {
        /// Match to register.
        match_id: MatchId,
    },

    /// Hand in this wallet's signed authorization.
    SubmitAuth(SubmitAuthRequest),

    /// Cancel a match.
    CancelMatch {
        /// Match to cancel.
        match_id: MatchId,
        /// Why; defaults to `player_cancelled`.
        #[serde(default)]
        reason: Option<String>,
    },

    /// Commit a hidden move.
    CommitMove(CommitMoveRequest),

    /// Reveal a committed move.
    RevealMove(RevealMoveRequest),

    /// Receive notifications for a match.
    Subscribe {
        /// Match to watch.
        match_id: MatchId,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// JWT whose subject is the wallet address.
    pub token: String,
    /// Client version for compatibility check.
    pub client_version: String,
}

/// Signed authorization from a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAuthRequest {
    /// Match.
    pub match_id: MatchId,
    /// Signed entry.
    pub entry: AuthEntry,
    /// Transaction payload the client cached at prepare time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Move commitment with its proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMoveRequest {
    /// Match.
    pub match_id: MatchId,
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

/// Move reveal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealMoveRequest {
    /// Match.
    pub match_id: MatchId,
    /// Round number.
    pub round: u32,
    /// Turn number.
    pub turn: u32,
    /// Move played this turn.
    pub move_type: MoveType,
    /// Committed plan.
    pub plan: MovePlan,
    /// Winner this client computed (`None` = draw).
    #[serde(default)]
    pub expected_winner: Option<Address>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Registration status for this client.
    Registration(RegistrationUpdate),

    /// Cancel request result.
    Cancel(CancelResult),

    /// Commit or reveal result.
    Round(RoundUpdate),

    /// Subscription confirmed.
    Subscribed {
        /// Match being watched.
        match_id: MatchId,
    },

    /// Pushed match event.
    Notification {
        /// Match.
        match_id: MatchId,
        /// Event.
        notification: MatchNotification,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (unix millis).
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Authenticated wallet address.
    pub address: Option<Address>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// What this client should show for a match registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationUpdate {
    /// Match.
    pub match_id: MatchId,
    /// Client-visible status.
    pub status: RegistrationStatus,
    /// Reserved session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Registration transaction, once landed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TxId>,
    /// Transaction payload to cache for restart recovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Entry this client must sign.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_entry: Option<AuthEntry>,
    /// Ledger bound for the signature's expiration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_valid_until: Option<u32>,
    /// Addresses signed so far.
    #[serde(default)]
    pub signed: Vec<Address>,
    /// Addresses still missing.
    #[serde(default)]
    pub waiting_for: Vec<Address>,
}

impl RegistrationUpdate {
    fn bare(match_id: MatchId, status: RegistrationStatus) -> Self {
        Self {
            match_id,
            status,
            session_id: None,
            tx_id: None,
            payload: None,
            auth_entry: None,
            auth_valid_until: None,
            signed: Vec::new(),
            waiting_for: Vec::new(),
        }
    }

    /// Update for `address` after a prepare call.
    pub fn from_prepare(match_id: MatchId, address: &Address, outcome: &PrepareOutcome) -> Self {
        match outcome {
            PrepareOutcome::Registered { session_id, tx_id } => Self {
                session_id: Some(*session_id),
                tx_id: tx_id.clone(),
                ..Self::bare(match_id, RegistrationStatus::Complete)
            },
            PrepareOutcome::AwaitingSignatures(view) => Self::from_view(address, view),
        }
    }

    fn from_view(address: &Address, view: &RegistrationView) -> Self {
        let status = if view.signed.contains(address) {
            RegistrationStatus::WaitingForOpponent
        } else if view.entry_for(address).is_some() {
            RegistrationStatus::Signing
        } else {
            RegistrationStatus::Skipped
        };
        let waiting_for = view
            .required_auth_addresses
            .iter()
            .filter(|a| !view.signed.contains(a))
            .cloned()
            .collect();
        Self {
            session_id: Some(view.session_id),
            payload: Some(view.payload.clone()),
            auth_entry: view.entry_for(address).cloned(),
            auth_valid_until: Some(view.auth_valid_until),
            signed: view.signed.clone(),
            waiting_for,
            ..Self::bare(view.match_id, status)
        }
    }

    /// Update after a signature was handed in.
    pub fn from_progress(match_id: MatchId, progress: &RegistrationProgress) -> Self {
        let mut update = Self::bare(match_id, RegistrationStatus::from(progress));
        match progress {
            RegistrationProgress::Waiting { signed, waiting_for } => {
                update.signed = signed.clone();
                update.waiting_for = waiting_for.clone();
            }
            RegistrationProgress::Complete { session_id, tx_id } => {
                update.session_id = Some(*session_id);
                update.tx_id = tx_id.clone();
            }
            RegistrationProgress::Submitting | RegistrationProgress::NotRequired => {}
        }
        update
    }
}

/// Cancel result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResult {
    /// Match.
    pub match_id: MatchId,
    /// Outcome.
    pub state: CancelState,
}

/// Outcome of a cancel request, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    /// Cancelled now.
    Cancelled,
    /// Runs once the in-flight submission resolves.
    Deferred,
    /// Was already cancelled.
    AlreadyCancelled,
}

impl From<&CancelOutcome> for CancelState {
    fn from(outcome: &CancelOutcome) -> Self {
        match outcome {
            CancelOutcome::Cancelled { .. } => Self::Cancelled,
            CancelOutcome::Deferred => Self::Deferred,
            CancelOutcome::AlreadyCancelled => Self::AlreadyCancelled,
        }
    }
}

/// Commit or reveal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundUpdate {
    /// Match.
    pub match_id: MatchId,
    /// Round number.
    pub round: u32,
    /// Turn number.
    pub turn: u32,
    /// Turn state after the request.
    pub state: RoundState,
    /// The commit was a replay of a stored one.
    #[serde(default)]
    pub replayed: bool,
    /// Players that revealed, while waiting on the opponent.
    #[serde(default)]
    pub revealed: Vec<Address>,
    /// Accepted outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<RoundResolution>,
}

impl RoundUpdate {
    /// Update after a commit.
    pub fn committed(match_id: MatchId, round: u32, turn: u32, outcome: &CommitOutcome) -> Self {
        let (state, replayed) = match outcome {
            CommitOutcome::Recorded(state) => (*state, false),
            CommitOutcome::Replayed(state) => (*state, true),
        };
        Self { match_id, round, turn, state, replayed, revealed: Vec::new(), resolution: None }
    }

    /// Update after a reveal.
    pub fn revealed(match_id: MatchId, round: u32, turn: u32, outcome: &ResolveOutcome) -> Self {
        let (state, revealed, resolution) = match outcome {
            ResolveOutcome::AwaitingReveal { revealed } => (RoundState::BothCommitted, revealed.clone(), None),
            ResolveOutcome::Resolved(resolution) => (RoundState::Resolved, Vec::new(), Some(resolution.clone())),
        };
        Self { match_id, round, turn, state, replayed: false, revealed, resolution }
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Repeating the request may succeed.
    #[serde(default)]
    pub retryable: bool,
}

impl ServerError {
    /// Transport-level error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.as_str().to_string(), message: message.into(), retryable: false }
    }
}

impl From<&CoordinatorError> for ServerError {
    fn from(err: &CoordinatorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Transport error codes. Coordinator failures use
/// [`CoordinatorError::code`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Message could not be parsed.
    InvalidInput,
    /// Internal error.
    InternalError,
}

impl ErrorCode {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "auth_failed",
            Self::NotAuthenticated => "not_authenticated",
            Self::TokenExpired => "token_expired",
            Self::InvalidToken => "invalid_token",
            Self::InvalidInput => "invalid_input",
            Self::InternalError => "internal_error",
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::RegistrationPhase;

    fn view(signed: Vec<Address>) -> RegistrationView {
        let alice = Address::new("GALICE");
        let bob = Address::new("GBOB");
        RegistrationView {
            match_id: MatchId::from_bytes([4; 16]),
            session_id: SessionId::from_raw(77),
            payload: "00ff".into(),
            auth_entries: vec![
                AuthEntry::unsigned(alice.clone(), 1, [1; 32]),
                AuthEntry::unsigned(bob.clone(), 2, [1; 32]),
            ],
            required_auth_addresses: vec![alice, bob],
            auth_valid_until: 160,
            signed,
            phase: RegistrationPhase::Collecting,
        }
    }

    #[test]
    fn test_client_message_tags() {
        let id = MatchId::from_bytes([1; 16]);
        let json = ClientMessage::PrepareRegistration { match_id: id }.to_json().unwrap();
        assert!(json.contains("\"type\":\"prepare_registration\""));

        let parsed = ClientMessage::from_json(&json).unwrap();
        assert_eq!(parsed, ClientMessage::PrepareRegistration { match_id: id });
    }

    #[test]
    fn test_cancel_reason_optional() {
        let id = MatchId::from_bytes([2; 16]);
        let json = format!("{{\"type\":\"cancel_match\",\"match_id\":\"{}\"}}", id);
        let parsed = ClientMessage::from_json(&json).unwrap();
        assert_eq!(parsed, ClientMessage::CancelMatch { match_id: id, reason: None });
    }

    #[test]
    fn test_prepare_update_per_client() {
        let v = view(vec![Address::new("GALICE")]);
        let id = v.match_id;
        let outcome = PrepareOutcome::AwaitingSignatures(v);

        let alice = RegistrationUpdate::from_prepare(id, &Address::new("GALICE"), &outcome);
        assert_eq!(alice.status, RegistrationStatus::WaitingForOpponent);
        assert_eq!(alice.waiting_for, vec![Address::new("GBOB")]);

        let bob = RegistrationUpdate::from_prepare(id, &Address::new("GBOB"), &outcome);
        assert_eq!(bob.status, RegistrationStatus::Signing);
        assert_eq!(bob.auth_entry.map(|e| e.nonce), Some(2));

        let eve = RegistrationUpdate::from_prepare(id, &Address::new("GEVE"), &outcome);
        assert_eq!(eve.status, RegistrationStatus::Skipped);
        assert!(eve.auth_entry.is_none());
    }

    #[test]
    fn test_progress_update() {
        let id = MatchId::from_bytes([3; 16]);
        let update = RegistrationUpdate::from_progress(id, &RegistrationProgress::Complete {
            session_id: SessionId::from_raw(9),
            tx_id: None,
        });
        assert_eq!(update.status, RegistrationStatus::Complete);
        assert_eq!(update.session_id, Some(SessionId::from_raw(9)));

        let json = ServerMessage::Registration(update).to_json().unwrap();
        assert!(json.contains("\"status\":\"complete\""));
        assert!(!json.contains("payload"));
    }

    #[test]
    fn test_error_from_coordinator() {
        let err = CoordinatorError::StaleSequence { attempts: 4 };
        let wire = ServerError::from(&err);
        assert_eq!(wire.code, "stale_sequence");
        assert!(wire.retryable);

        let json = ServerMessage::Error(ServerError::new(ErrorCode::NotAuthenticated, "auth first")).to_json().unwrap();
        assert!(json.contains("not_authenticated"));
    }

    #[test]
    fn test_notification_wrapping() {
        let id = MatchId::from_bytes([5; 16]);
        let msg = ServerMessage::Notification {
            match_id: id,
            notification: MatchNotification::MatchCancelled { reason: "signature_timeout".into(), redirect_to: "/play".into() },
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"event\":\"match_cancelled\""));
        assert_eq!(ServerMessage::from_json(&json).unwrap(), msg);
    }
}
