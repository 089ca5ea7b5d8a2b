//! Network Layer
//!
//! WebSocket front end and match notification fan-out.
//! No registration or round logic lives here; requests are routed to
//! `registration/` and `proof/`.

pub mod auth;
pub mod notify;
pub mod protocol;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, TokenClaims};
pub use notify::{BroadcastNotifier, MatchNotification, Notifier};
pub use protocol::{ClientMessage, RegistrationUpdate, RoundUpdate, ServerError, ServerMessage};
pub use server::{CoordinatorServer, CoordinatorServerError, ServerConfig};
