//! Match Notifications
//!
//! Fire-and-forget fan-out of match-scoped events to subscribed clients.
//! Delivery is best effort: a lagging or absent subscriber loses events,
//! so consumers must treat every event as idempotent.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::ids::{Address, MatchId, SessionId, TxId};
use crate::proof::commitment::MoveType;

/// Capacity of each match's broadcast channel.
const CHANNEL_CAPACITY: usize = 64;

/// Events published for a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MatchNotification {
    /// A player's registration authorization was recorded.
    RegistrationAuthReceived {
        /// Signer.
        address: Address,
        /// Addresses signed so far.
        signed: Vec<Address>,
        /// Addresses still missing.
        waiting_for: Vec<Address>,
    },

    /// Registration landed on-chain.
    RegistrationComplete {
        /// Registered session.
        session_id: SessionId,
        /// Transaction id, if the submission that landed is known.
        tx_id: Option<TxId>,
    },

    /// Registration failed; clients must sign again.
    RegistrationFailed {
        /// Error code.
        code: String,
        /// Human-readable reason.
        message: String,
    },

    /// Match cancelled.
    MatchCancelled {
        /// Why.
        reason: String,
        /// Where clients should go next.
        redirect_to: String,
    },

    /// A player committed a hidden move.
    RoundCommitted {
        /// Round.
        round: u32,
        /// Turn.
        turn: u32,
        /// Committing player.
        player: Address,
        /// Both players have now committed.
        both_committed: bool,
    },

    /// Both reveals accepted.
    RoundResolved {
        /// Round.
        round: u32,
        /// Turn.
        turn: u32,
        /// Revealed moves per player.
        moves: BTreeMap<Address, MoveType>,
        /// Agreed winner, if any.
        winner: Option<Address>,
    },
}

impl MatchNotification {
    /// Event name, as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegistrationAuthReceived { .. } => "registration_auth_received",
            Self::RegistrationComplete { .. } => "registration_complete",
            Self::RegistrationFailed { .. } => "registration_failed",
            Self::MatchCancelled { .. } => "match_cancelled",
            Self::RoundCommitted { .. } => "round_committed",
            Self::RoundResolved { .. } => "round_resolved",
        }
    }
}

/// Outbound event sink.
pub trait Notifier: Send + Sync {
    /// Publish `event` to everyone watching `match_id`.
    fn publish(&self, match_id: MatchId, event: MatchNotification);
}

/// One tokio broadcast channel per match.
#[derive(Debug, Default)]
pub struct BroadcastNotifier {
    channels: RwLock<BTreeMap<MatchId, broadcast::Sender<MatchNotification>>>,
}

impl BroadcastNotifier {
    /// Create a notifier with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a match's events.
    pub fn subscribe(&self, match_id: MatchId) -> broadcast::Receiver<MatchNotification> {
        let mut channels = self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(match_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop channels nobody listens to anymore.
    pub fn prune(&self) {
        let mut channels = self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Number of matches with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, match_id: MatchId, event: MatchNotification) {
        let channels = self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match channels.get(&match_id) {
            Some(tx) => {
                // No receivers is not an error.
                let _ = tx.send(event);
            }
            None => debug!(match_id = %match_id, event = event.name(), "no subscribers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let notifier = BroadcastNotifier::new();
        let match_id = MatchId::new_v4();
        let mut rx = notifier.subscribe(match_id);

        notifier.publish(match_id, MatchNotification::MatchCancelled {
            reason: "signature_timeout".into(),
            redirect_to: "/play".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "match_cancelled");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = BroadcastNotifier::new();
        notifier.publish(MatchId::new_v4(), MatchNotification::RegistrationFailed {
            code: "ledger".into(),
            message: "boom".into(),
        });
        assert_eq!(notifier.channel_count(), 0);
    }

    #[test]
    fn test_prune_drops_dead_channels() {
        let notifier = BroadcastNotifier::new();
        let rx = notifier.subscribe(MatchId::new_v4());
        assert_eq!(notifier.channel_count(), 1);
        drop(rx);
        notifier.prune();
        assert_eq!(notifier.channel_count(), 0);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&MatchNotification::RegistrationComplete {
            session_id: SessionId::new(12).unwrap(),
            tx_id: None,
        })
        .unwrap();
        assert!(json.contains("\"event\":\"registration_complete\""));
        assert!(json.contains("\"session_id\":12"));
    }
}
