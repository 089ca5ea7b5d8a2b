//! # Duel Coordinator
//!
//! Server-side coordination for two-player on-chain duels: client-signed
//! match registration and hidden-move commit/reveal rounds.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DUEL COORDINATOR                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Identifiers and domain-separated hashing  │
//! │  ledger/         - Ledger, wallet and envelope-signer seams  │
//! │  store/          - Match records + versioned pending state   │
//! │                                                              │
//! │  registration/   - Client-signed registration                │
//! │  ├── allocator.rs  - Session id reservation                  │
//! │  ├── preparer.rs   - Simulation + auth extraction            │
//! │  ├── coordinator.rs- Per-match state machine                 │
//! │  ├── retrier.rs    - Stale-sequence rebuild + resubmit       │
//! │  ├── cancel.rs     - Cancellation / compensation             │
//! │  └── status.rs     - Client-visible status                   │
//! │                                                              │
//! │  proof/          - Move commitments, proof checks, rounds    │
//! │                                                              │
//! │  network/        - WebSocket server, auth, notifications     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Exactly-Once Submission
//!
//! Pending registrations live behind a versioned store. The write that
//! records the last missing signature also sets the `submitted` guard, so
//! only one request ever reaches the ledger for a match:
//! - No lock is held across ledger calls
//! - Concurrent writers lose the version check and re-read
//! - Stale sequences are rebuilt and resubmitted, then checked on-chain

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod ledger;
pub mod network;
pub mod proof;
pub mod registration;
pub mod store;

// Re-export commonly used types
pub use config::{CoordinatorConfig, RegistrationMode, RetryConfig};
pub use crate::core::ids::{Address, MatchId, SessionId, TxId};
pub use error::{CoordinatorError, CoordinatorResult};
pub use proof::{MovePlan, MoveType, RoundCommitmentLedger};
pub use registration::{RegistrationCoordinator, RegistrationStatus};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
